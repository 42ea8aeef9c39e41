//! scatter-crypto: at-rest encryption for scatter blobs
//!
//! Confidentiality only. Each blob is an XChaCha20 keystream applied to the
//! plaintext, prefixed with the random nonce it was generated from:
//!
//! ```text
//! [24 bytes: random nonce][N bytes: plaintext XOR keystream]
//! ```
//!
//! There is no authentication tag. A corrupted or tampered blob decrypts to
//! corrupted plaintext without any error.

pub mod keys;
pub mod stream;

pub use keys::{generate_key, EncryptionKey};
pub use stream::{copy_decrypt, copy_encrypt};

/// Size of a node encryption key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the XChaCha20 nonce written in front of every blob (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Plaintext is transformed in bounded chunks of this many bytes
pub const CHUNK_SIZE: usize = 32 * 1024;
