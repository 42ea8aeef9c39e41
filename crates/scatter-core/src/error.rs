use std::net::SocketAddr;
use thiserror::Error;

pub type ScatterResult<T> = Result<T, ScatterError>;

#[derive(Debug, Error)]
pub enum ScatterError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("timed out fetching key {key} from network")]
    FetchTimeout { key: String },

    #[error("peer not found: {0}")]
    PeerNotFound(SocketAddr),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
