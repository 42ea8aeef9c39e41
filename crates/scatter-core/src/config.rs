use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level node configuration (loaded from scatter.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterConfig {
    pub node: NodeConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// TCP listen address (default: 127.0.0.1:3000)
    pub listen_addr: String,
    /// Peers dialed once at startup
    pub bootstrap_nodes: Vec<String>,
    /// Root directory of the local blob store
    pub storage_root: PathBuf,
    /// At-rest encryption key file (default: encryption_keys/<listen_addr>_key)
    pub key_file: Option<PathBuf>,
    /// Wait between announcing a Store and streaming its payload
    pub settle_delay_ms: u64,
    /// Upper bound on a network Get
    pub fetch_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Prometheus metrics endpoint, disabled when unset
    pub metrics_addr: Option<String>,
}

impl NodeConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Key file path, derived from the listen address when not configured.
    pub fn key_file_path(&self) -> PathBuf {
        match &self.key_file {
            Some(path) => path.clone(),
            None => {
                let name = self.listen_addr.replace([':', '/'], "_");
                PathBuf::from("encryption_keys").join(format!("{name}_key"))
            }
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".into(),
            bootstrap_nodes: Vec::new(),
            storage_root: PathBuf::from("scatter_storage"),
            key_file: None,
            settle_delay_ms: 500,
            fetch_timeout_ms: 3000,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
            metrics_addr: None,
        }
    }
}
