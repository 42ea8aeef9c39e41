//! The file server: local encrypted storage plus replication to peers.
//!
//! Every blob is encrypted at rest under this node's key. Payloads cross the
//! wire as plaintext and each receiver re-encrypts under its own key.
//!
//! Inbound traffic is routed by the dispatch loop in arrival order, which is
//! what ties each stream to its exchange (see [`crate::link`]). Anything that
//! waits on disk or the network runs in its own task.

use anyhow::Context;
use futures::future::join_all;
use scatter_core::{Message, ScatterError, ScatterResult};
use scatter_crypto::{copy_decrypt, copy_encrypt, EncryptionKey, CHUNK_SIZE};
use scatter_p2p::{
    read_size_header, Rpc, TcpPeer, TcpTransport, TcpTransportOpts, SIZE_ABSENT,
};
use scatter_storage::Storage;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::{Link, PendingReply, PendingStore, ReplySender, StreamOwner};
use crate::locks::KeyLocks;
use crate::metrics::NodeMetrics;
use crate::registry::PeerRegistry;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

pub struct FileServerOpts {
    /// Transport settings. The peer callbacks are wrapped by the server;
    /// any callbacks set here still run after the server's own bookkeeping.
    pub transport: TcpTransportOpts,
    pub storage: Storage,
    pub bootstrap_nodes: Vec<String>,
    pub encryption_key: EncryptionKey,
    /// Pause between announcing a Store and streaming its payload.
    pub settle_delay: Duration,
    /// Upper bound on waiting for any peer to answer a Get.
    pub fetch_timeout: Duration,
}

impl FileServerOpts {
    pub fn new(
        listen_addr: impl Into<String>,
        storage: Storage,
        encryption_key: EncryptionKey,
    ) -> Self {
        FileServerOpts {
            transport: TcpTransportOpts::new(listen_addr),
            storage,
            bootstrap_nodes: Vec::new(),
            encryption_key,
            settle_delay: DEFAULT_SETTLE_DELAY,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

pub struct FileServer {
    transport: TcpTransport,
    storage: Storage,
    bootstrap_nodes: Vec<String>,
    key: EncryptionKey,
    settle_delay: Duration,
    fetch_timeout: Duration,
    peers: Arc<PeerRegistry>,
    locks: KeyLocks,
    /// Serializes Store fan-outs, which take every link's exchange lock.
    fanout: TokioMutex<()>,
    metrics: NodeMetrics,
    shutdown: CancellationToken,
}

impl FileServer {
    pub fn new(mut opts: FileServerOpts) -> Self {
        let peers = Arc::new(PeerRegistry::new());
        let metrics = NodeMetrics::default();

        let user_on_peer = opts.transport.on_peer.take();
        let registry = peers.clone();
        let m = metrics.clone();
        opts.transport.on_peer = Some(Arc::new(move |peer: Arc<TcpPeer>| {
            info!(
                peer = %peer.remote_addr(),
                incoming = peer.is_incoming(),
                "connected to remote"
            );
            let _link = registry.register(peer.clone());
            m.peers.set(registry.len() as i64);
            match &user_on_peer {
                Some(cb) => cb(peer),
                None => Ok(()),
            }
        }));

        let user_on_disconnect = opts.transport.on_disconnect.take();
        let registry = peers.clone();
        let m = metrics.clone();
        opts.transport.on_disconnect = Some(Arc::new(move |addr: SocketAddr| {
            if registry.remove(&addr).is_some() {
                info!(peer = %addr, "peer disconnected, removed from registry");
            }
            m.peers.set(registry.len() as i64);
            if let Some(cb) = &user_on_disconnect {
                cb(addr);
            }
        }));

        FileServer {
            transport: TcpTransport::new(opts.transport),
            storage: opts.storage,
            bootstrap_nodes: opts.bootstrap_nodes,
            key: opts.encryption_key,
            settle_delay: opts.settle_delay,
            fetch_timeout: opts.fetch_timeout,
            peers,
            locks: KeyLocks::new(),
            fanout: TokioMutex::new(()),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Listen, dial the bootstrap nodes, and start dispatching inbound
    /// messages in the background. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> ScatterResult<SocketAddr> {
        let addr = self.transport.listen_and_accept().await?;
        let inbound = self
            .transport
            .consume()
            .ok_or_else(|| anyhow::anyhow!("file server {addr} already started"))?;

        self.bootstrap_network();
        tokio::spawn(self.clone().dispatch_loop(inbound));

        info!(addr = %addr, bootstrap = self.bootstrap_nodes.len(), "file server started");
        Ok(addr)
    }

    /// Stop dispatching, close the transport, and drop every peer.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.transport.close();
        self.peers.clear();
        self.metrics.peers.set(0);
    }

    pub fn addr(&self) -> String {
        self.transport.addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Addresses of the currently registered peers, sorted.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.addrs()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Whether a blob for `key` is present in local storage.
    pub async fn has(&self, key: &str) -> bool {
        self.storage.exists(key).await
    }

    /// Encrypt and persist everything readable from `src` under `key`, then
    /// replicate the plaintext to every connected peer.
    ///
    /// Returns the plaintext size.
    pub async fn store<R>(&self, key: &str, src: &mut R) -> ScatterResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut plaintext = Vec::new();
        src.read_to_end(&mut plaintext).await?;
        let size = plaintext.len() as u64;

        {
            let _guard = self.locks.lock(key).await;
            let written = self.write_local(key, &plaintext).await?;
            info!(addr = %self.addr(), key, bytes = written, "wrote file to storage");
        }
        self.metrics.stores.inc();

        let _fanout = self.fanout.lock().await;
        let links = self.peers.snapshot();
        // Nothing else may stream to these peers between the announcement
        // and the payload.
        let mut exchanges = Vec::with_capacity(links.len());
        for link in &links {
            exchanges.push(link.lock_exchange().await);
        }

        let reached = self
            .broadcast(
                &links,
                &Message::Store {
                    key: key.to_string(),
                    size,
                },
            )
            .await?;
        if reached.is_empty() {
            return Ok(size);
        }

        tokio::time::sleep(self.settle_delay).await;

        let sends = reached.iter().map(|link| {
            let mut body = &plaintext[..];
            async move { (link.remote_addr(), link.peer().send_stream(None, &mut body).await) }
        });
        for (peer, res) in join_all(sends).await {
            match res {
                Ok(n) => {
                    self.metrics.bytes_sent.inc_by(n);
                    debug!(addr = %self.addr(), peer = %peer, key, bytes = n, "replicated file");
                }
                Err(e) => {
                    // The peer is now waiting on a stream that will not come.
                    warn!(addr = %self.addr(), peer = %peer, key, "replication failed, dropping peer: {e:#}");
                    self.peers.remove(&peer);
                }
            }
        }
        Ok(size)
    }

    /// Return the plaintext for `key`, from local storage if present, otherwise
    /// from the first peer that delivers it. A network hit is persisted
    /// locally before being returned.
    pub async fn get(&self, key: &str) -> ScatterResult<Vec<u8>> {
        {
            let _guard = self.locks.lock(key).await;
            if self.storage.exists(key).await {
                info!(addr = %self.addr(), key, "serving file locally");
                self.metrics.gets_local.inc();
                return self.read_local(key).await;
            }
        }

        info!(addr = %self.addr(), key, "file not stored locally, fetching from network");
        let payload = self.fetch(key).await?;

        let _guard = self.locks.lock(key).await;
        self.write_local(key, &payload).await?;
        self.metrics.gets_network.inc();
        self.read_local(key).await
    }

    /// Delete the local copy (if any) and ask every peer to do the same.
    /// Peers are not waited on.
    pub async fn remove(&self, key: &str) -> ScatterResult<()> {
        {
            let _guard = self.locks.lock(key).await;
            self.delete_local(key).await?;
        }
        self.metrics.removes.inc();
        self.broadcast(
            &self.peers.snapshot(),
            &Message::Remove {
                key: key.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Delete the local copy only.
    pub async fn remove_local(&self, key: &str) -> ScatterResult<()> {
        let _guard = self.locks.lock(key).await;
        self.delete_local(key).await?;
        Ok(())
    }

    /// Handle one decoded control message from `from`.
    ///
    /// A Store only records the announcement; the payload is persisted when
    /// its stream arrives.
    pub async fn handle_message(&self, from: SocketAddr, msg: Message) -> ScatterResult<()> {
        self.metrics.inbound(msg.kind());
        match msg {
            Message::Get { key } => self.handle_get(from, &key).await,
            Message::Store { key, size } => self.accept_store(from, &key, size),
            Message::Remove { key } => self.handle_remove(from, &key).await,
        }
    }

    fn link(&self, addr: SocketAddr) -> ScatterResult<Arc<Link>> {
        self.peers.get(&addr).ok_or(ScatterError::PeerNotFound(addr))
    }

    async fn handle_get(&self, from: SocketAddr, key: &str) -> ScatterResult<()> {
        let link = self.link(from)?;
        let local = {
            let _guard = self.locks.lock(key).await;
            if self.storage.exists(key).await {
                Some(self.read_local(key).await)
            } else {
                None
            }
        };

        let _exchange = link.lock_exchange().await;
        match local {
            Some(Ok(plaintext)) => {
                let n = self
                    .send_reply(&link, plaintext.len() as i64, &mut &plaintext[..])
                    .await?;
                self.metrics.bytes_sent.inc_by(n);
                info!(addr = %self.addr(), peer = %from, key, bytes = n, "served file over the network");
                Ok(())
            }
            Some(Err(e)) => {
                // The requester counts on exactly one reply per Get.
                self.send_reply(&link, SIZE_ABSENT, &mut tokio::io::empty())
                    .await?;
                warn!(addr = %self.addr(), peer = %from, key, "unreadable file answered as absent");
                Err(e)
            }
            None => {
                self.send_reply(&link, SIZE_ABSENT, &mut tokio::io::empty())
                    .await?;
                info!(addr = %self.addr(), peer = %from, key, "do not have file");
                Ok(())
            }
        }
    }

    /// Send one Get reply. A failed send leaves the requester's view of the
    /// connection unknowable, so the peer is dropped.
    async fn send_reply<R>(&self, link: &Link, size: i64, body: &mut R) -> ScatterResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match link.peer().send_stream(Some(size), body).await {
            Ok(n) => Ok(n),
            Err(e) => {
                self.peers.remove(&link.remote_addr());
                Err(e.into())
            }
        }
    }

    fn accept_store(&self, from: SocketAddr, key: &str, size: u64) -> ScatterResult<()> {
        let link = self.link(from)?;
        link.expect_store(key, size);
        debug!(addr = %self.addr(), peer = %from, key, size, "store announced");
        Ok(())
    }

    async fn handle_remove(&self, from: SocketAddr, key: &str) -> ScatterResult<()> {
        self.link(from)?;
        info!(addr = %self.addr(), peer = %from, key, "received remove request");
        let _guard = self.locks.lock(key).await;
        self.delete_local(key).await?;
        Ok(())
    }

    /// Read an announced Store's payload off the connection, then persist
    /// it. Only stream errors are returned; a failed local write is logged.
    async fn receive_store(&self, link: &Link, pending: PendingStore) -> anyhow::Result<()> {
        let PendingStore { key, size } = pending;
        let from = link.remote_addr();

        // Drain before taking the key lock so the receive loop is never
        // paused behind local work.
        let payload = {
            let mut stream = link.peer().read_stream().await?;
            let mut buf = Vec::with_capacity(size.min(CHUNK_SIZE as u64) as usize);
            (&mut stream).take(size).read_to_end(&mut buf).await?;
            stream.release();
            buf
        };
        if payload.len() as u64 != size {
            anyhow::bail!(
                "store stream for {key} ended after {} of {size} bytes",
                payload.len()
            );
        }
        self.metrics.bytes_received.inc_by(size);

        let _guard = self.locks.lock(&key).await;
        match self.write_local(&key, &payload).await {
            Ok(written) => info!(
                addr = %self.addr(),
                peer = %from,
                key = %key,
                received = size,
                written,
                "stored replica"
            ),
            Err(e) => warn!(addr = %self.addr(), peer = %from, key = %key, "persisting replica failed: {e}"),
        }
        Ok(())
    }

    /// Read a Get reply. It goes to the fetch that is waiting on it, or is
    /// drained and dropped if that fetch is over or nothing asked.
    async fn receive_reply(&self, link: &Link, pending: Option<PendingReply>) -> anyhow::Result<()> {
        let from = link.remote_addr();
        let mut stream = link.peer().read_stream().await?;

        let size = read_size_header(&mut stream).await?;
        if size == SIZE_ABSENT {
            debug!(peer = %from, "peer does not have file");
            return Ok(());
        }
        let size = u64::try_from(size).map_err(|_| anyhow::anyhow!("bad size header {size}"))?;

        let Some(pending) = pending.as_ref().filter(|p| p.is_wanted()) else {
            let drained = tokio::io::copy(&mut (&mut stream).take(size), &mut tokio::io::sink()).await?;
            debug!(peer = %from, drained, "reply no longer wanted, discarded");
            return Ok(());
        };

        let mut payload = Vec::with_capacity(size.min(CHUNK_SIZE as u64) as usize);
        (&mut stream).take(size).read_to_end(&mut payload).await?;
        stream.release();
        if payload.len() as u64 != size {
            anyhow::bail!("reply ended after {} of {size} bytes", payload.len());
        }
        self.metrics.bytes_received.inc_by(size);

        if pending.won.try_send((from, payload)).is_err() {
            debug!(peer = %from, "lost the fetch race");
        }
        Ok(())
    }

    /// Send `msg` to each of `links` concurrently. Returns the links it
    /// reached; a peer that could not be sent to is dropped.
    async fn broadcast(&self, links: &[Arc<Link>], msg: &Message) -> ScatterResult<Vec<Arc<Link>>> {
        let body = msg.to_bytes()?;
        let sends = links.iter().map(|link| {
            let body = &body;
            async move {
                let res = link.peer().send_message(body).await;
                (link, res)
            }
        });

        let mut reached = Vec::new();
        for (link, res) in join_all(sends).await {
            match res {
                Ok(()) => reached.push(link.clone()),
                Err(e) => {
                    warn!(
                        addr = %self.addr(),
                        peer = %link.remote_addr(),
                        kind = msg.kind(),
                        "broadcast failed, dropping peer: {e:#}"
                    );
                    self.peers.remove(&link.remote_addr());
                }
            }
        }
        debug!(addr = %self.addr(), kind = msg.kind(), peers = reached.len(), "broadcast");
        Ok(reached)
    }

    /// Ask every peer for `key` and race the replies. The first complete
    /// payload wins; later ones are drained and discarded as they arrive.
    async fn fetch(&self, key: &str) -> ScatterResult<Vec<u8>> {
        let body = Message::Get {
            key: key.to_string(),
        }
        .to_bytes()?;
        let links = self.peers.snapshot();

        let race = self.shutdown.child_token();
        let (won_tx, mut won_rx) = mpsc::channel(1);
        for link in &links {
            tokio::spawn(request(
                link.clone(),
                body.clone(),
                race.clone(),
                won_tx.clone(),
                self.peers.clone(),
            ));
        }
        debug!(addr = %self.addr(), key, peers = links.len(), "asked peers for file");

        // `won_tx` stays alive so an all-absent race still waits out the timeout.
        let outcome = tokio::time::timeout(self.fetch_timeout, won_rx.recv()).await;
        race.cancel();
        drop(won_tx);

        match outcome {
            Ok(Some((from, payload))) => {
                info!(
                    addr = %self.addr(),
                    peer = %from,
                    key,
                    bytes = payload.len(),
                    "received file over the network"
                );
                Ok(payload)
            }
            Ok(None) | Err(_) => {
                self.metrics.fetch_timeouts.inc();
                warn!(addr = %self.addr(), key, timeout = ?self.fetch_timeout, "fetch timed out");
                Err(ScatterError::FetchTimeout {
                    key: key.to_string(),
                })
            }
        }
    }

    async fn write_local(&self, key: &str, plaintext: &[u8]) -> ScatterResult<u64> {
        let (mut pipe_w, mut pipe_r) = tokio::io::duplex(CHUNK_SIZE);
        let key_ref = &self.key;
        let encrypt = async move {
            let mut src = plaintext;
            let res = copy_encrypt(key_ref, &mut src, &mut pipe_w)
                .await
                .context("encrypting blob");
            drop(pipe_w);
            res
        };
        let (_, written) = tokio::try_join!(encrypt, self.storage.write(key, &mut pipe_r))
            .map_err(|e| ScatterError::Storage(format!("{e:#}")))?;
        Ok(written)
    }

    async fn read_local(&self, key: &str) -> ScatterResult<Vec<u8>> {
        let (_, mut file) = self
            .storage
            .read(key)
            .await
            .map_err(|e| ScatterError::Storage(format!("{e:#}")))?;
        let mut plaintext = Vec::new();
        copy_decrypt(&self.key, &mut file, &mut plaintext)
            .await
            .map_err(|e| ScatterError::Crypto(format!("{e:#}")))?;
        Ok(plaintext)
    }

    async fn delete_local(&self, key: &str) -> ScatterResult<bool> {
        if !self.storage.exists(key).await {
            info!(addr = %self.addr(), key, "do not have file");
            return Ok(false);
        }
        self.storage
            .delete(key)
            .await
            .map_err(|e| ScatterError::Storage(format!("{e:#}")))?;
        info!(addr = %self.addr(), key, "removed file");
        Ok(true)
    }

    fn bootstrap_network(self: &Arc<Self>) {
        for addr in self.bootstrap_nodes.iter().filter(|a| !a.is_empty()) {
            let server = self.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                info!(addr = %server.addr(), remote = %addr, "dialing bootstrap node");
                if let Err(e) = server.transport.dial(&addr).await {
                    warn!(addr = %server.addr(), remote = %addr, "dial failed: {e:#}");
                }
            });
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<Rpc>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                rpc = inbound.recv() => match rpc {
                    Some(rpc) => self.route(rpc),
                    None => break,
                },
            }
        }
        self.transport.close();
        info!(addr = %self.addr(), "file server stopped");
    }

    /// Runs on the dispatch loop in arrival order. Store announcements and
    /// stream ownership are settled here, before anything is spawned.
    fn route(self: &Arc<Self>, rpc: Rpc) {
        let from = rpc.from;
        if rpc.stream {
            self.route_stream(from);
            return;
        }

        let msg = match Message::from_bytes(&rpc.payload) {
            Ok(msg) => msg,
            Err(e) => {
                // It may have been a Store, leaving a stream nobody can own.
                warn!(addr = %self.addr(), peer = %from, "undecodable message, dropping peer: {e}");
                self.peers.remove(&from);
                return;
            }
        };
        let kind = msg.kind();

        if let Message::Store { key, size } = &msg {
            self.metrics.inbound(kind);
            if let Err(e) = self.accept_store(from, key, *size) {
                warn!(addr = %self.addr(), peer = %from, kind, "handling message: {e}");
            }
            return;
        }

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.handle_message(from, msg).await {
                warn!(addr = %server.addr(), peer = %from, kind, "handling message: {e}");
            }
        });
    }

    fn route_stream(self: &Arc<Self>, from: SocketAddr) {
        // An unregistered peer has been closed; its receive loop is ending.
        let Some(link) = self.peers.get(&from) else {
            debug!(addr = %self.addr(), peer = %from, "stream from unregistered peer ignored");
            return;
        };
        let owner = link.claim_stream();

        let server = self.clone();
        tokio::spawn(async move {
            let res = match owner {
                StreamOwner::Store(pending) => server.receive_store(&link, pending).await,
                StreamOwner::Reply(pending) => server.receive_reply(&link, Some(pending)).await,
                StreamOwner::Unclaimed => {
                    debug!(addr = %server.addr(), peer = %from, "unsolicited stream, discarding");
                    server.receive_reply(&link, None).await
                }
            };
            if let Err(e) = res {
                warn!(addr = %server.addr(), peer = %from, "reading stream failed, dropping peer: {e:#}");
                server.peers.remove(&from);
            }
        });
    }
}

/// Send one Get to `link`, after any earlier Get to the same peer has been
/// answered. Gives up quietly once the race is over.
async fn request(
    link: Arc<Link>,
    body: Vec<u8>,
    race: CancellationToken,
    won: ReplySender,
    peers: Arc<PeerRegistry>,
) {
    let from = link.remote_addr();
    let id = tokio::select! {
        _ = race.cancelled() => return,
        reserved = link.expect_reply(race.clone(), won) => match reserved {
            Ok(id) => id,
            Err(e) => {
                debug!(peer = %from, "not asking: {e:#}");
                return;
            }
        },
    };
    if let Err(e) = link.peer().send_message(&body).await {
        link.cancel_reply(id);
        warn!(peer = %from, "sending get failed, dropping peer: {e:#}");
        peers.remove(&from);
    }
}
