//! Live peers known to a node, keyed by remote address.

use scatter_p2p::TcpPeer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::link::Link;

/// Guarded map of connected peers.
///
/// The lock is a plain `std::sync::Mutex`: it is only held for map
/// operations, never across an `.await`.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<SocketAddr, Arc<Link>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Arc<Link>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `peer`. A previous entry for the same address is closed and
    /// replaced.
    pub fn register(&self, peer: Arc<TcpPeer>) -> Arc<Link> {
        let addr = peer.remote_addr();
        let link = Arc::new(Link::new(peer));
        if let Some(old) = self.lock().insert(addr, link.clone()) {
            debug!(peer = %addr, "replacing stale registry entry");
            old.close();
        }
        link
    }

    /// Drop the entry for `addr` and close it. The connection's receive loop
    /// ends and its disconnect callback fires.
    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<Link>> {
        let removed = self.lock().remove(addr);
        if let Some(link) = &removed {
            link.close();
        }
        removed
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Link>> {
        self.lock().get(addr).cloned()
    }

    /// Point-in-time copy of every registered link, sorted by address.
    pub fn snapshot(&self) -> Vec<Arc<Link>> {
        let mut links: Vec<_> = self.lock().values().cloned().collect();
        links.sort_by_key(|link| link.remote_addr());
        links
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<_> = self.lock().keys().copied().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close and forget every peer.
    pub fn clear(&self) {
        for (_, link) in self.lock().drain() {
            link.close();
        }
    }
}
