pub mod config;
pub mod error;
pub mod types;

pub use error::{ScatterError, ScatterResult};
pub use types::Message;

/// Largest control-frame body accepted on the wire, in bytes.
pub const MAX_FRAME_SIZE: usize = 1028;
