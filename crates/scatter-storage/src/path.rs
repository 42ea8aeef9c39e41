//! Key → on-disk location derivation

use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::path::PathBuf;

/// Hex characters per shard directory.
pub const SHARD_LEN: usize = 10;

/// Maps a key to its location under the storage root. Must be pure.
pub type PathTransform = fn(&str) -> PathKey;

/// Sharded directory path plus file name for a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Shard directories joined with `/`
    pub path_name: String,
    pub file_name: String,
}

impl PathKey {
    /// `path_name/file_name`, relative to the storage root.
    pub fn full_path(&self) -> PathBuf {
        self.dir().join(&self.file_name)
    }

    /// Shard directories only, relative to the storage root.
    pub fn dir(&self) -> PathBuf {
        self.path_name.split('/').collect()
    }

    /// First shard segment.
    pub fn first_path(&self) -> &str {
        self.path_name.split('/').next().unwrap_or_default()
    }
}

/// Default transform: the SHA-1 digest of the key split into [`SHARD_LEN`]
/// groups for the directories, the SHA-256 digest of the key as file name.
///
/// Two unrelated hashes keep a directory collision from implying a file-name
/// collision.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = format!("{:x}", Sha1::digest(key.as_bytes()));

    let shards: Vec<&str> = digest
        .as_bytes()
        .chunks(SHARD_LEN)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect();

    PathKey {
        path_name: shards.join("/"),
        file_name: format!("{:x}", Sha256::digest(key.as_bytes())),
    }
}
