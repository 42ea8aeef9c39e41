//! scatterd: scatter file store node
//!
//! Usage:
//!   scatterd [--config scatter.toml] [--listen 127.0.0.1:3000] [--peer ADDR]...
//!
//! Runs one node until SIGINT/SIGTERM or `quit` on the console.

mod console;
mod daemon;
mod metrics;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use scatter_core::config::ScatterConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "scatterd", version, about = "scatter peer-to-peer encrypted file store node")]
struct Cli {
    /// Path to scatter.toml configuration file
    #[arg(long, short = 'c', env = "SCATTER_CONFIG", default_value = "scatter.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [daemon].log_level
    #[arg(long, env = "SCATTER_LOG")]
    log: Option<String>,

    /// Log format; overrides [daemon].log_format
    #[arg(long, env = "SCATTER_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Listen address; overrides [node].listen_addr
    #[arg(long, short = 'l', env = "SCATTER_LISTEN")]
    listen: Option<String>,

    /// Bootstrap peer address (repeatable); replaces [node].bootstrap_nodes
    #[arg(long = "peer", short = 'p')]
    peers: Vec<String>,

    /// Do not read commands from stdin
    #[arg(long)]
    no_console: bool,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, found) = load_config(&cli.config).await?;
    if let Some(listen) = cli.listen {
        config.node.listen_addr = listen;
    }
    if !cli.peers.is_empty() {
        config.node.bootstrap_nodes = cli.peers;
    }

    let level = cli.log.unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.unwrap_or(match config.daemon.log_format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        listen = %config.node.listen_addr,
        "scatterd starting"
    );
    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    daemon::run(config, !cli.no_console).await
}

/// Parse the config file, or fall back to defaults when it does not exist.
/// The flag reports whether the file was found.
async fn load_config(path: &Path) -> Result<(ScatterConfig, bool)> {
    if !path.exists() {
        return Ok((ScatterConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    let config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
