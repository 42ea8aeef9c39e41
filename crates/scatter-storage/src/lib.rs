//! scatter-storage: content-addressed blob store on the local filesystem
//!
//! Blobs live at `<root>/<shard_1>/.../<shard_4>/<file_name>` where the shards
//! are 10-hex-char groups of the key's SHA-1 digest and the file name is the
//! key's SHA-256 digest.

pub mod health;
pub mod path;
pub mod store;

pub use health::{check_health, is_healthy};
pub use path::{cas_path_transform, PathKey, PathTransform, SHARD_LEN};
pub use store::Storage;
