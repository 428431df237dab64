//! In-process relay connecting several replicas without a network.
//!
//! Deltas published by a replica wait in its outbox until
//! [`LoopbackRelay::deliver_all`] runs. Delivery assigns every delta a
//! place in one shared log (publish order), then hands each connected
//! replica the log entries it has not seen: its own entries as
//! acknowledgements, everyone else's as remote mutations.
//!
//! A disconnected replica keeps writing locally; its outbox is held back and
//! it receives nothing until [`LoopbackRelay::reconnect`], after which the
//! missed entries are replayed in order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::map::{Broadcaster, Delta};
use crate::stores::BoardStores;

pub type ReplicaId = usize;

struct ReplicaSlot {
    stores: Weak<BoardStores>,
    connected: bool,
    /// Index of the next log entry to deliver.
    cursor: usize,
    outbox: VecDeque<(u64, Delta)>,
}

struct RelayState {
    log: Vec<(ReplicaId, Delta)>,
    replicas: Vec<ReplicaSlot>,
    next_stamp: u64,
}

struct Endpoint {
    state: Weak<Mutex<RelayState>>,
    id: ReplicaId,
}

impl Broadcaster for Endpoint {
    fn publish(&self, delta: Delta) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        let stamp = state.next_stamp;
        state.next_stamp += 1;
        if let Some(slot) = state.replicas.get_mut(self.id) {
            slot.outbox.push_back((stamp, delta));
        }
    }
}

struct Delivery {
    stores: Arc<BoardStores>,
    own: bool,
    delta: Delta,
}

/// Deterministic, manually pumped broadcast substrate.
#[derive(Clone)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                log: Vec::new(),
                replicas: Vec::new(),
                next_stamp: 0,
            })),
        }
    }

    /// Create a connected replica. It starts from the beginning of the log,
    /// so a late joiner catches up on the next delivery.
    pub fn spawn_replica(&self) -> (ReplicaId, Arc<BoardStores>) {
        let id = {
            let mut state = self.lock();
            state.replicas.push(ReplicaSlot {
                stores: Weak::new(),
                connected: true,
                cursor: 0,
                outbox: VecDeque::new(),
            });
            state.replicas.len() - 1
        };

        let endpoint = Endpoint {
            state: Arc::downgrade(&self.state),
            id,
        };
        let stores = Arc::new(BoardStores::new(Arc::new(endpoint)));

        if let Some(slot) = self.lock().replicas.get_mut(id) {
            slot.stores = Arc::downgrade(&stores);
        }
        (id, stores)
    }

    pub fn disconnect(&self, id: ReplicaId) {
        self.set_connected(id, false);
    }

    pub fn reconnect(&self, id: ReplicaId) {
        self.set_connected(id, true);
    }

    pub fn is_connected(&self, id: ReplicaId) -> bool {
        self.lock().replicas.get(id).is_some_and(|slot| slot.connected)
    }

    /// Number of deltas sequenced so far.
    pub fn log_len(&self) -> usize {
        self.lock().log.len()
    }

    /// Deltas waiting in a replica's outbox.
    pub fn outbox_len(&self, id: ReplicaId) -> usize {
        self.lock().replicas.get(id).map_or(0, |slot| slot.outbox.len())
    }

    /// Sequence and deliver until no connected replica has anything pending.
    ///
    /// Returns the number of deliveries made. Deliveries happen outside the
    /// relay lock, so listeners may publish during delivery; those deltas
    /// are picked up by the next round.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                return delivered;
            }
            delivered += batch.len();

            for Delivery { stores, own, delta } in batch {
                let result = if own {
                    stores.acknowledge(&delta)
                } else {
                    stores.apply_remote(&delta)
                };
                if let Err(e) = result {
                    log::warn!("loopback delivery failed: {e}");
                }
            }
        }
    }

    fn next_batch(&self) -> Vec<Delivery> {
        let mut state = self.lock();

        let mut ready: Vec<(u64, ReplicaId, Delta)> = Vec::new();
        for (id, slot) in state.replicas.iter_mut().enumerate() {
            if slot.connected {
                ready.extend(slot.outbox.drain(..).map(|(stamp, delta)| (stamp, id, delta)));
            }
        }
        ready.sort_by_key(|(stamp, _, _)| *stamp);
        state
            .log
            .extend(ready.into_iter().map(|(_, id, delta)| (id, delta)));

        let RelayState { log, replicas, .. } = &mut *state;
        let mut batch = Vec::new();
        for (id, slot) in replicas.iter_mut().enumerate() {
            if !slot.connected || slot.cursor >= log.len() {
                continue;
            }
            let pending = &log[slot.cursor..];
            slot.cursor = log.len();
            let Some(stores) = slot.stores.upgrade() else {
                continue;
            };
            batch.extend(pending.iter().map(|(origin, delta)| Delivery {
                stores: stores.clone(),
                own: *origin == id,
                delta: delta.clone(),
            }));
        }
        batch
    }

    fn set_connected(&self, id: ReplicaId, connected: bool) {
        if let Some(slot) = self.lock().replicas.get_mut(id) {
            slot.connected = connected;
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LoopbackRelay {
    fn default() -> Self {
        Self::new()
    }
}
