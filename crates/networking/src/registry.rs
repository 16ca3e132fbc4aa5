//! Registry of connected peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::peer::Peer;

/// Concurrency-safe directory of currently connected peers, keyed by
/// remote address.
///
/// All mutations and the [`all`](Self::all) snapshot go through a
/// single guard. `all` copies the peer handles out before returning,
/// so callers never perform network I/O while the guard is held.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer, returning any previous entry for the address.
    pub async fn add(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        let mut peers = self.peers.lock().await;
        peers.insert(peer.addr(), peer)
    }

    pub async fn remove(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        let mut peers = self.peers.lock().await;
        peers.remove(addr)
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        let peers = self.peers.lock().await;
        peers.get(addr).cloned()
    }

    /// Snapshot of all connected peers; safe to iterate while the
    /// registry keeps changing.
    pub async fn all(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.lock().await;
        peers.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let peers = self.peers.lock().await;
        peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
