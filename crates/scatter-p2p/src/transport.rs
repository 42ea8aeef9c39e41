//! TCP listener, dialer, and per-connection receive loop

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::{Decoder, DefaultDecoder, Frame, Rpc};
use crate::handshake::{nop_handshake, HandshakeFn};
use crate::peer::TcpPeer;

/// Called after a successful handshake. An error closes the connection.
pub type OnPeerFn = Arc<dyn Fn(Arc<TcpPeer>) -> Result<()> + Send + Sync>;

/// Called once when a registered connection's receive loop ends.
pub type OnDisconnectFn = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Inbound queue depth; the receive loop blocks when the consumer lags.
const INBOUND_QUEUE: usize = 64;

pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub decoder: Arc<dyn Decoder>,
    pub on_peer: Option<OnPeerFn>,
    pub on_disconnect: Option<OnDisconnectFn>,
}

impl TcpTransportOpts {
    /// No-op handshake, default decoder, no callbacks.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        TcpTransportOpts {
            listen_addr: listen_addr.into(),
            handshake: nop_handshake(),
            decoder: Arc::new(DefaultDecoder),
            on_peer: None,
            on_disconnect: None,
        }
    }
}

struct Shared {
    opts: TcpTransportOpts,
    inbound: mpsc::Sender<Rpc>,
    shutdown: CancellationToken,
    bound: OnceLock<SocketAddr>,
}

/// Owns the listening socket and every connection's receive loop.
///
/// Control frames and stream markers from all connections land in one
/// queue, see [`consume`](Self::consume).
pub struct TcpTransport {
    shared: Arc<Shared>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        TcpTransport {
            shared: Arc::new(Shared {
                opts,
                inbound: tx,
                shutdown: CancellationToken::new(),
                bound: OnceLock::new(),
            }),
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    /// The bound listen address once listening, the configured one before.
    pub fn addr(&self) -> String {
        match self.shared.bound.get() {
            Some(addr) => addr.to_string(),
            None => self.shared.opts.listen_addr.clone(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.bound.get().copied()
    }

    /// Bind the listener and start accepting in the background.
    pub async fn listen_and_accept(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.shared.opts.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.shared.opts.listen_addr))?;
        let addr = listener.local_addr().context("reading bound address")?;
        let _ = self.shared.bound.set(addr);

        tokio::spawn(accept_loop(self.shared.clone(), listener));

        info!(addr = %addr, "transport listening");
        Ok(addr)
    }

    /// Open an outbound connection; its receive loop runs in the background.
    pub async fn dial(&self, addr: &str) -> Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("dialing {addr}"))?;
        tokio::spawn(handle_conn(self.shared.clone(), stream, false));
        Ok(())
    }

    /// Take the inbound queue. Only the first call gets it.
    pub fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Stop accepting and tear down every connection's receive loop.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                debug!("accept loop stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_conn(shared.clone(), stream, true));
                }
                Err(e) => warn!("error accepting connection: {e}"),
            },
        }
    }
}

async fn handle_conn(shared: Arc<Shared>, stream: TcpStream, incoming: bool) {
    let peer = match TcpPeer::new(stream, incoming) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            warn!("dropping connection: {e:#}");
            return;
        }
    };
    let from = peer.remote_addr();

    if let Err(e) = (shared.opts.handshake)(peer.as_ref()).await {
        warn!(peer = %from, "handshake failed: {e:#}");
        peer.shutdown_writer().await;
        return;
    }

    if let Some(on_peer) = &shared.opts.on_peer {
        if let Err(e) = on_peer(peer.clone()) {
            warn!(peer = %from, "on-peer callback failed: {e:#}");
            peer.shutdown_writer().await;
            return;
        }
    }

    debug!(peer = %from, incoming, "receive loop started");

    if let Err(e) = receive_loop(&shared, &peer).await {
        debug!(peer = %from, "receive loop ended: {e:#}");
    }

    peer.close();
    peer.shutdown_writer().await;
    if let Some(on_disconnect) = &shared.opts.on_disconnect {
        on_disconnect(from);
    }
    info!(peer = %from, "connection closed");
}

async fn receive_loop(shared: &Shared, peer: &TcpPeer) -> Result<()> {
    let from = peer.remote_addr();
    loop {
        let frame = {
            let mut reader = peer.lock_reader().await;
            tokio::select! {
                _ = shared.shutdown.cancelled() => return Ok(()),
                _ = peer.wait_closed() => return Ok(()),
                frame = shared.opts.decoder.decode(&mut *reader) => {
                    frame.context("decoding frame")?
                }
            }
        };

        match frame {
            Frame::Message(payload) => {
                if !deliver(shared, peer, Rpc::message(from, payload)).await? {
                    return Ok(());
                }
            }
            Frame::Stream => {
                debug!(peer = %from, "incoming stream, pausing receive loop");
                // Announce before queueing the marker: whoever handles the
                // marker must find the stream already claimable.
                peer.announce_stream();
                if !deliver(shared, peer, Rpc::stream_marker(from)).await? {
                    return Ok(());
                }
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return Ok(()),
                    released = peer.wait_stream_released() => released?,
                }
                debug!(peer = %from, "stream released, resuming receive loop");
            }
        }
    }
}

/// Queue `rpc` for the consumer. Returns false if the connection is being
/// torn down instead.
async fn deliver(shared: &Shared, peer: &TcpPeer, rpc: Rpc) -> Result<bool> {
    tokio::select! {
        _ = shared.shutdown.cancelled() => Ok(false),
        _ = peer.wait_closed() => Ok(false),
        sent = shared.inbound.send(rpc) => {
            sent.map_err(|_| anyhow::anyhow!("inbound queue closed"))?;
            Ok(true)
        }
    }
}
