//! Daemon lifecycle: key, storage, file server, metrics, console, signals

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use scatter_core::config::ScatterConfig;
use scatter_crypto::EncryptionKey;
use scatter_node::{FileServer, FileServerOpts};
use scatter_storage::Storage;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::metrics::HealthState;

pub async fn run(config: ScatterConfig, console: bool) -> Result<()> {
    info!("daemon starting");

    let key_path = config.node.key_file_path();
    let key = EncryptionKey::load_or_create(&key_path)
        .with_context(|| format!("loading encryption key: {}", key_path.display()))?;
    info!(path = %key_path.display(), "encryption key ready");

    let storage = Storage::with_defaults(&config.node.storage_root);
    match scatter_storage::check_health(&storage).await {
        Ok(()) => info!(root = %storage.root().display(), "storage: ready"),
        Err(e) => warn!(root = %storage.root().display(), "storage: {e:#}"),
    }

    let mut opts = FileServerOpts::new(config.node.listen_addr.clone(), storage, key);
    opts.bootstrap_nodes = config.node.bootstrap_nodes.clone();
    opts.settle_delay = config.node.settle_delay();
    opts.fetch_timeout = config.node.fetch_timeout();

    let server = Arc::new(FileServer::new(opts));
    let addr = server
        .start()
        .await
        .with_context(|| format!("starting file server on {}", config.node.listen_addr))?;
    info!(addr = %addr, bootstrap = ?config.node.bootstrap_nodes, "node listening");

    // Start Prometheus metrics endpoint
    if let Some(metrics_addr) = config.daemon.metrics_addr.clone() {
        let mut registry = Registry::default();
        server.metrics().register(&mut registry);
        let state = HealthState {
            registry: Arc::new(registry),
            server: server.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(metrics_addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    notify_ready();

    let console_task = console.then(|| tokio::spawn(crate::console::run(server.clone())));

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        _ = console_quit(console_task) => info!("console requested shutdown"),
    }

    server.stop();
    info!("daemon stopped");
    Ok(())
}

/// Resolves once the console asks to quit. A console that ends on EOF leaves
/// the daemon running.
async fn console_quit(task: Option<JoinHandle<bool>>) {
    if let Some(task) = task {
        match task.await {
            Ok(true) => return,
            Ok(false) => info!("console input closed; running until signalled"),
            Err(e) => warn!("console task failed: {e}"),
        }
    }
    std::future::pending::<()>().await
}

fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op without $NOTIFY_SOCKET
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
