//! Node encryption key: generation and key-file persistence

use anyhow::{Context, Result};
use rand::RngCore;
use std::path::Path;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A node's 256-bit at-rest encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build a key from an arbitrary slice; fails unless it is exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = data.try_into().map_err(|_| {
            anyhow::anyhow!(
                "encryption key has wrong size: {} bytes (expected {})",
                data.len(),
                KEY_SIZE
            )
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Load the key stored at `path`, or generate one and persist it there
    /// (mode 0600) when the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let mut data = std::fs::read(path)
                .with_context(|| format!("reading key file: {}", path.display()))?;
            let key = Self::from_slice(&data)
                .with_context(|| format!("loading key file: {}", path.display()));
            data.zeroize();
            tracing::debug!(path = %path.display(), "encryption key loaded");
            return key;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating key dir: {}", parent.display()))?;
            }
        }

        let key = generate_key();
        write_private(path, key.as_bytes())
            .with_context(|| format!("writing key file: {}", path.display()))?;
        tracing::info!(path = %path.display(), "generated new encryption key");
        Ok(key)
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit encryption key.
pub fn generate_key() -> EncryptionKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    EncryptionKey::from_bytes(bytes)
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_generation() {
        let k1 = generate_key();
        let k2 = generate_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_from_slice_wrong_size() {
        let err = EncryptionKey::from_slice(&[0u8; 16]).unwrap_err();
        assert!(err.to_string().contains("wrong size"));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = EncryptionKey::from_bytes([7u8; KEY_SIZE]);
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains('7'));
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keys/node_key");

        let first = EncryptionKey::load_or_create(&path).unwrap();
        assert!(path.exists());
        let second = EncryptionKey::load_or_create(&path).unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node_key");
        EncryptionKey::load_or_create(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_rejects_truncated_key_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("short_key");
        std::fs::write(&path, b"too short").unwrap();

        assert!(EncryptionKey::load_or_create(&path).is_err());
    }
}
