//! Fan-out of encoded messages to every peer of a board.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! messages; a peer that falls further behind observes `Lagged` and the
//! loss is counted in [`BroadcastStats::messages_dropped`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters; read through [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single board.
///
/// Every message reaches all peers, including the sender; relay deltas
/// double as acknowledgements for their origin.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    /// Remove a peer from this broadcast group.
    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id)
    }

    /// Encode and broadcast a message. Returns the number of receivers.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Count messages a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Get broadcast statistics (lock-free counters plus peer count).
    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
