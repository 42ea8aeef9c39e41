//! Storage health check

use anyhow::{Context, Result};
use tokio::fs;

use crate::store::Storage;

const PROBE_FILE: &str = ".scatter-health";

/// Verify the storage root exists (creating it if needed) and is writable.
pub async fn check_health(storage: &Storage) -> Result<()> {
    let root = storage.root();
    fs::create_dir_all(root)
        .await
        .with_context(|| format!("storage health check failed: creating {}", root.display()))?;

    let probe = root.join(PROBE_FILE);
    fs::write(&probe, b"ok")
        .await
        .with_context(|| format!("storage health check failed: writing {}", probe.display()))?;
    fs::remove_file(&probe)
        .await
        .with_context(|| format!("storage health check failed: removing {}", probe.display()))
}

/// Returns true if storage is usable, false otherwise (non-panicking)
pub async fn is_healthy(storage: &Storage) -> bool {
    check_health(storage).await.is_ok()
}
