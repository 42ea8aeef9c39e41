use serde::{Deserialize, Serialize};

use crate::error::{ScatterError, ScatterResult};
use crate::MAX_FRAME_SIZE;

/// A control message exchanged between nodes.
///
/// Encoded as the body of a control frame. Stream payloads that follow a
/// `Store` (or answer a `Get`) travel as raw bytes, never inside a `Message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Ask peers for the plaintext of `key`.
    Get { key: String },
    /// Announce that `size` plaintext bytes for `key` follow as a stream.
    Store { key: String, size: u64 },
    /// Ask peers to drop their copy of `key`.
    Remove { key: String },
}

impl Message {
    pub fn key(&self) -> &str {
        match self {
            Message::Get { key } => key,
            Message::Store { key, .. } => key,
            Message::Remove { key } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Get { .. } => "get",
            Message::Store { .. } => "store",
            Message::Remove { .. } => "remove",
        }
    }

    /// Serialize into a control-frame body. Fails if the body would exceed
    /// [`MAX_FRAME_SIZE`].
    pub fn to_bytes(&self) -> ScatterResult<Vec<u8>> {
        let body = serde_json::to_vec(self)
            .map_err(|e| ScatterError::Decode(format!("serializing Message: {e}")))?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(ScatterError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(body)
    }

    pub fn from_bytes(data: &[u8]) -> ScatterResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ScatterError::Decode(format!("deserializing Message: {e}")))
    }
}
