//! Sharded blob store on the local filesystem.
//!
//! The store knows nothing about encryption or the network: it persists
//! whatever bytes it is handed under the location derived from the key.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use crate::path::{cas_path_transform, PathKey, PathTransform};

pub struct Storage {
    root: PathBuf,
    transform: PathTransform,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        Storage {
            root: root.into(),
            transform,
        }
    }

    /// Store rooted at `root` using [`cas_path_transform`].
    pub fn with_defaults(root: impl Into<PathBuf>) -> Self {
        Self::new(root, cas_path_transform)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_key(&self, key: &str) -> PathKey {
        (self.transform)(key)
    }

    /// Absolute location of the blob for `key`.
    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(self.path_key(key).full_path())
    }

    /// Copy `reader` to completion into the blob for `key`, replacing any
    /// previous content. Returns the number of bytes written.
    ///
    /// Content goes to a temp file first and is renamed into place, so a
    /// reader never sees a half-written blob.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let pk = self.path_key(key);
        let dir = self.root.join(pk.dir());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating shard dir: {}", dir.display()))?;

        let path = dir.join(&pk.file_name);
        let tmp = path.with_extension("tmp");

        let mut file = create_tmp(&dir, &tmp).await?;
        let n = tokio::io::copy(reader, &mut file)
            .await
            .with_context(|| format!("writing blob for key {key}"))?;
        file.flush().await?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing blob tmp: {}", tmp.display()))?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming blob into place: {}", path.display()))?;

        debug!(key, bytes = n, path = %path.display(), "blob written");
        Ok(n)
    }

    /// Open the blob for `key`. Returns its size and a reader over it.
    pub async fn read(&self, key: &str) -> Result<(u64, fs::File)> {
        let path = self.blob_path(key);
        let file = fs::File::open(&path)
            .await
            .with_context(|| format!("opening blob for key {key}: {}", path.display()))?;
        let size = file
            .metadata()
            .await
            .with_context(|| format!("stat blob: {}", path.display()))?
            .len();
        Ok((size, file))
    }

    pub async fn exists(&self, key: &str) -> bool {
        fs::try_exists(self.blob_path(key)).await.unwrap_or(false)
    }

    /// Remove the blob for `key` and any shard directories it leaves empty.
    /// Removing an absent key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let pk = self.path_key(key);
        let path = self.root.join(pk.full_path());

        match fs::remove_file(&path).await {
            Ok(()) => debug!(key, path = %path.display(), "blob deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("deleting blob: {}", path.display()))
            }
        }

        // Prune now-empty shard dirs bottom-up; stop at the first non-empty one.
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }

        Ok(())
    }

    /// Remove the whole first-level shard that `key` lives in, including every
    /// other blob sharing that shard prefix.
    pub async fn evict_shard(&self, key: &str) -> Result<()> {
        let pk = self.path_key(key);
        let shard = self.root.join(pk.first_path());
        match fs::remove_dir_all(&shard).await {
            Ok(()) => {
                debug!(key, shard = %shard.display(), "shard evicted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("evicting shard: {}", shard.display())),
        }
    }

    /// Remove everything under the storage root.
    pub async fn reset(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("resetting storage: {}", self.root.display()))
            }
        }
    }
}

/// Create the temp file inside `dir`. A concurrent `delete` of a neighbour
/// may prune `dir` between its creation and here, so recreate it once.
async fn create_tmp(dir: &Path, tmp: &Path) -> Result<fs::File> {
    match fs::File::create(tmp).await {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "shard dir pruned under us, recreating");
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("recreating shard dir: {}", dir.display()))?;
            fs::File::create(tmp)
                .await
                .with_context(|| format!("creating blob tmp: {}", tmp.display()))
        }
        Err(e) => Err(e).with_context(|| format!("creating blob tmp: {}", tmp.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_read_exists_delete() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::with_defaults(tmp.path().join("root"));

        let key = "testkey";
        let data = b"random data";

        let n = storage.write(key, &mut &data[..]).await.unwrap();
        assert_eq!(n as usize, data.len());
        assert!(storage.exists(key).await);

        let (size, mut file) = storage.read(key).await.unwrap();
        assert_eq!(size as usize, data.len());
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, data);

        storage.delete(key).await.unwrap();
        assert!(!storage.exists(key).await);

        storage.reset().await.unwrap();
        assert!(!storage.root().exists());
    }

    #[tokio::test]
    async fn test_blob_lands_at_sharded_path() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::with_defaults(tmp.path());

        storage.write("testkey", &mut &b"x"[..]).await.unwrap();

        let expected = tmp
            .path()
            .join("913a73b565/c8e2c8ed94/497580f619/397709b8b6")
            .join("98483c6eb40b6c31a448c22a66ded3b5e5e8d5119cac8327b655c8b5c4836489");
        assert!(expected.is_file());
        assert!(!expected.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::with_defaults(tmp.path());

        storage.write("k", &mut &b"first version"[..]).await.unwrap();
        storage.write("k", &mut &b"v2"[..]).await.unwrap();

        let (size, mut file) = storage.read("k").await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(size, 2);
        assert_eq!(buf, b"v2");
    }

    #[tokio::test]
    async fn test_read_missing_fails() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::with_defaults(tmp.path());
        assert!(!storage.exists("nope").await);
        assert!(storage.read("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_shards() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::with_defaults(tmp.path());

        storage.write("testkey", &mut &b"x"[..]).await.unwrap();
        storage.delete("testkey").await.unwrap();

        assert!(!tmp.path().join("913a73b565").exists());
        assert!(tmp.path().exists(), "root itself must survive");
        // second delete is a no-op
        storage.delete("testkey").await.unwrap();
    }

    fn shared_shard_transform(key: &str) -> PathKey {
        PathKey {
            path_name: format!("shared/{key}"),
            file_name: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_delete_spares_shard_neighbours() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path(), shared_shard_transform);

        storage.write("a", &mut &b"aaa"[..]).await.unwrap();
        storage.write("b", &mut &b"bbb"[..]).await.unwrap();

        storage.delete("a").await.unwrap();
        assert!(!storage.exists("a").await);
        assert!(storage.exists("b").await);
    }

    #[tokio::test]
    async fn test_evict_shard_is_broad() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path(), shared_shard_transform);

        storage.write("a", &mut &b"aaa"[..]).await.unwrap();
        storage.write("b", &mut &b"bbb"[..]).await.unwrap();

        storage.evict_shard("a").await.unwrap();
        assert!(!storage.exists("a").await);
        assert!(!storage.exists("b").await);
        assert!(!tmp.path().join("shared").exists());
    }

    #[tokio::test]
    async fn test_tmp_create_recovers_pruned_shard() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("pruned/shard");
        let blob_tmp = dir.join("blob.tmp");

        // As if a neighbour's delete removed the dir right after create_dir_all.
        let file = create_tmp(&dir, &blob_tmp).await.unwrap();
        drop(file);
        assert!(blob_tmp.is_file());
    }

    #[tokio::test]
    async fn test_reset_missing_root_ok() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::with_defaults(tmp.path().join("never-created"));
        storage.reset().await.unwrap();
    }
}
