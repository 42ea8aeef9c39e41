//! Pluggable per-connection handshake

use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::peer::TcpPeer;

/// Runs once on every new connection before any frame is read. An error
/// closes the connection without registering the peer.
pub type HandshakeFn = Arc<dyn for<'a> Fn(&'a TcpPeer) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Accepts every connection without exchanging any bytes.
pub fn nop_handshake() -> HandshakeFn {
    Arc::new(nop)
}

fn nop(_peer: &TcpPeer) -> BoxFuture<'_, Result<()>> {
    Box::pin(async { Ok(()) })
}
