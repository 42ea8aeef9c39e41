//! Per-connection protocol state.
//!
//! Streams carry no key or request id, so a node works out what an inbound
//! stream is for from the order things arrived on that connection:
//!
//! - a stream that follows an unmatched `Store` announcement carries that
//!   Store's payload;
//! - any other stream is the reply to this node's outstanding `Get`, and at
//!   most one `Get` per connection is outstanding at a time.
//!
//! On the sending side, [`Link::lock_exchange`] keeps a Store announcement
//! and its stream adjacent: Get replies take the same lock, so no reply can
//! land in between.

use scatter_p2p::TcpPeer;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Mutex as TokioMutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Where the winning Get reply is sent: the peer it came from and the
/// plaintext.
pub type ReplySender = mpsc::Sender<(SocketAddr, Vec<u8>)>;

/// A Store announced by the remote whose stream has not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStore {
    pub key: String,
    pub size: u64,
}

/// The one Get this node is waiting on the remote to answer.
pub struct PendingReply {
    id: u64,
    pub race: CancellationToken,
    pub won: ReplySender,
    _outstanding: OwnedSemaphorePermit,
}

impl PendingReply {
    /// Whether the fetch this reply belongs to still wants it.
    pub fn is_wanted(&self) -> bool {
        !self.race.is_cancelled()
    }
}

/// Who the next inbound stream on a connection belongs to.
pub enum StreamOwner {
    Store(PendingStore),
    Reply(PendingReply),
    /// Nothing was expecting a stream. It is read as a Get reply and dropped.
    Unclaimed,
}

pub struct Link {
    peer: Arc<TcpPeer>,
    exchange: TokioMutex<()>,
    stores: Mutex<VecDeque<PendingStore>>,
    reply: Mutex<Option<PendingReply>>,
    outstanding: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl Link {
    pub fn new(peer: Arc<TcpPeer>) -> Self {
        Link {
            peer,
            exchange: TokioMutex::new(()),
            stores: Mutex::new(VecDeque::new()),
            reply: Mutex::new(None),
            outstanding: Arc::new(Semaphore::new(1)),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> &Arc<TcpPeer> {
        &self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer.remote_addr()
    }

    /// Exclusive right to put a stream on this connection. Hold it from a
    /// Store announcement through its stream, and around every Get reply.
    pub async fn lock_exchange(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exchange.lock().await
    }

    /// Record a Store announcement. Must be called in the order messages
    /// arrived on the connection.
    pub fn expect_store(&self, key: impl Into<String>, size: u64) {
        lock(&self.stores).push_back(PendingStore {
            key: key.into(),
            size,
        });
    }

    /// Wait until no Get to this peer is outstanding, then mark the next
    /// reply as belonging to `race`. Returns an id for
    /// [`cancel_reply`](Self::cancel_reply).
    ///
    /// Call before sending the Get, so the reply can never arrive first.
    /// Fails once the link is closed.
    pub async fn expect_reply(
        &self,
        race: CancellationToken,
        won: ReplySender,
    ) -> anyhow::Result<u64> {
        let permit = self
            .outstanding
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("peer {} closed", self.remote_addr()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *lock(&self.reply) = Some(PendingReply {
            id,
            race,
            won,
            _outstanding: permit,
        });
        Ok(id)
    }

    /// Withdraw the expectation registered as `id`, if it is still pending.
    /// Used when the Get could not be sent.
    pub fn cancel_reply(&self, id: u64) {
        let mut reply = lock(&self.reply);
        if reply.as_ref().map(|r| r.id) == Some(id) {
            *reply = None;
        }
    }

    /// Decide who the stream that just arrived belongs to. Must be called in
    /// the order streams arrived on the connection.
    pub fn claim_stream(&self) -> StreamOwner {
        if let Some(store) = lock(&self.stores).pop_front() {
            return StreamOwner::Store(store);
        }
        match lock(&self.reply).take() {
            Some(reply) => StreamOwner::Reply(reply),
            None => StreamOwner::Unclaimed,
        }
    }

    /// Close the connection and forget every expectation on it.
    pub fn close(&self) {
        self.peer.close();
        self.outstanding.close();
        lock(&self.stores).clear();
        lock(&self.reply).take();
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer.remote_addr())
            .field("pending_stores", &lock(&self.stores).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_link() -> (Link, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let peer = TcpPeer::new(dialed.unwrap(), false).unwrap();
        (Link::new(Arc::new(peer)), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_store_announcement_claims_before_reply() {
        let (link, _remote) = loopback_link().await;
        let (won, _rx) = mpsc::channel(1);
        link.expect_reply(CancellationToken::new(), won).await.unwrap();
        link.expect_store("k1", 7);

        assert!(matches!(
            link.claim_stream(),
            StreamOwner::Store(PendingStore { ref key, size: 7 }) if key == "k1"
        ));
        assert!(matches!(link.claim_stream(), StreamOwner::Reply(_)));
        assert!(matches!(link.claim_stream(), StreamOwner::Unclaimed));
    }

    #[tokio::test]
    async fn test_stores_claim_in_arrival_order() {
        let (link, _remote) = loopback_link().await;
        link.expect_store("first", 1);
        link.expect_store("second", 2);

        let keys: Vec<String> = (0..2)
            .map(|_| match link.claim_stream() {
                StreamOwner::Store(s) => s.key,
                _ => panic!("expected a store"),
            })
            .collect();
        assert_eq!(keys, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_one_outstanding_reply_at_a_time() {
        let (link, _remote) = loopback_link().await;
        let (won, _rx) = mpsc::channel(1);
        link.expect_reply(CancellationToken::new(), won.clone())
            .await
            .unwrap();

        // A second Get waits until the first reply has been consumed.
        let second = tokio::time::timeout(
            Duration::from_millis(100),
            link.expect_reply(CancellationToken::new(), won.clone()),
        )
        .await;
        assert!(second.is_err());

        let first = match link.claim_stream() {
            StreamOwner::Reply(r) => r,
            _ => panic!("expected the reply"),
        };
        drop(first);
        link.expect_reply(CancellationToken::new(), won).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_reply_only_drops_its_own() {
        let (link, _remote) = loopback_link().await;
        let (won, _rx) = mpsc::channel(1);
        let id = link.expect_reply(CancellationToken::new(), won).await.unwrap();

        link.cancel_reply(id + 1);
        assert!(matches!(link.claim_stream(), StreamOwner::Reply(_)));

        let (won, _rx) = mpsc::channel(1);
        let id = link.expect_reply(CancellationToken::new(), won).await.unwrap();
        link.cancel_reply(id);
        assert!(matches!(link.claim_stream(), StreamOwner::Unclaimed));
    }

    #[tokio::test]
    async fn test_close_fails_waiting_gets() {
        let (link, _remote) = loopback_link().await;
        link.expect_store("k", 1);
        link.close();

        assert!(link.is_closed());
        assert!(matches!(link.claim_stream(), StreamOwner::Unclaimed));
        let (won, _rx) = mpsc::channel(1);
        assert!(link.expect_reply(CancellationToken::new(), won).await.is_err());
    }
}
