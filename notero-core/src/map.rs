//! Last-write-wins replicated map.
//!
//! Every mutation is applied to the local replica first, then published as
//! a [`Delta`] through a pluggable [`Broadcaster`]. The transport delivers
//! deltas from other replicas via [`ReplicatedMap::apply_remote`] and echoes
//! this replica's own deltas back, in sequence order, via
//! [`ReplicatedMap::acknowledge`].
//!
//! ## Convergence
//!
//! ```text
//!  local set(k) ──► entries[k] = v, pending[k] = seq ──► publish
//!                                                          │
//!  remote op on k ──► ignored while pending[k] exists      │ (sequenced by
//!                                                          ▼  the transport)
//!  ack(k, seq) ◄───────────────────────────────────── own delta echoed
//!        └─► pending[k] cleared once its latest write is acknowledged
//! ```
//!
//! A pending local write is sequenced after every remote write this replica
//! has yet to see, so it wins on every replica. Skipping earlier remote
//! writes locally gives the same final value everywhere.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::event::{EventHub, Subscription};

/// One mutation as it travels between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Name of the map the mutation belongs to.
    pub map: String,
    /// JSON-encoded key. Transports may use it to compact history per key.
    pub key: String,
    /// Per-map counter of the originating replica.
    pub client_seq: u64,
    /// JSON-encoded [`MapOp`].
    pub op: Vec<u8>,
}

/// Outbound delivery substrate for map deltas.
///
/// `publish` must not block: writes are fire-and-forget. It is called while
/// the publishing map is locked, so it must not call back into that map.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, delta: Delta);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapOp<K, V> {
    Set { key: K, value: V },
    Delete { key: K },
}

impl<K, V> MapOp<K, V> {
    pub fn key(&self) -> &K {
        match self {
            MapOp::Set { key, .. } | MapOp::Delete { key } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Delete,
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Fired after every applied mutation, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapChange<K> {
    pub key: K,
    pub kind: ChangeKind,
    pub origin: ChangeOrigin,
}

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("delta for map `{found}` delivered to map `{expected}`")]
    WrongMap { expected: String, found: String },
    #[error("no replicated map named `{0}`")]
    UnknownMap(String),
    #[error("failed to decode delta for map `{map}`: {reason}")]
    Decode { map: String, reason: String },
}

struct MapState<K, V> {
    entries: HashMap<K, V>,
    /// Latest unacknowledged local write per key.
    pending: HashMap<K, u64>,
    next_seq: u64,
}

/// A key-value store replicated across participants, last write wins per key.
pub struct ReplicatedMap<K, V> {
    name: String,
    state: RwLock<MapState<K, V>>,
    outbound: Arc<dyn Broadcaster>,
    changed: EventHub<MapChange<K>>,
}

impl<K, V> ReplicatedMap<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, outbound: Arc<dyn Broadcaster>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MapState {
                entries: HashMap::new(),
                pending: HashMap::new(),
                next_seq: 0,
            }),
            outbound,
            changed: EventHub::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or overwrite `key`, then broadcast.
    pub fn set(&self, key: K, value: V) {
        {
            let mut state = self.write();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.entries.insert(key.clone(), value.clone());
            state.pending.insert(key.clone(), seq);
            // Published under the lock so deltas leave in client_seq order.
            self.publish(seq, MapOp::Set {
                key: key.clone(),
                value,
            });
        }

        self.changed.emit(&MapChange {
            key,
            kind: ChangeKind::Set,
            origin: ChangeOrigin::Local,
        });
    }

    /// Remove `key` and broadcast. Deleting an absent key does nothing.
    pub fn delete(&self, key: &K) {
        {
            let mut state = self.write();
            if state.entries.remove(key).is_none() {
                return;
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.pending.insert(key.clone(), seq);
            self.publish(seq, MapOp::Delete { key: key.clone() });
        }

        self.changed.emit(&MapChange {
            key: key.clone(),
            kind: ChangeKind::Delete,
            origin: ChangeOrigin::Local,
        });
    }

    /// Remove `key` if present, otherwise insert `make()`. The check and the
    /// write happen under one lock, so exactly one of them is published.
    pub fn toggle<F>(&self, key: K, make: F) -> ChangeKind
    where
        F: FnOnce() -> V,
    {
        let kind = {
            let mut state = self.write();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.pending.insert(key.clone(), seq);
            if state.entries.remove(&key).is_some() {
                self.publish(seq, MapOp::Delete { key: key.clone() });
                ChangeKind::Delete
            } else {
                let value = make();
                state.entries.insert(key.clone(), value.clone());
                self.publish(seq, MapOp::Set {
                    key: key.clone(),
                    value,
                });
                ChangeKind::Set
            }
        };

        self.changed.emit(&MapChange {
            key,
            kind,
            origin: ChangeOrigin::Local,
        });
        kind
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.read().entries.get(key).cloned()
    }

    pub fn has(&self, key: &K) -> bool {
        self.read().entries.contains_key(key)
    }

    /// Snapshot of all entries. Order is unspecified.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.read()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of all values. Order is unspecified.
    pub fn values(&self) -> Vec<V> {
        self.read().entries.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.read().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Number of local writes not yet acknowledged by the transport.
    pub fn pending_len(&self) -> usize {
        self.read().pending.len()
    }

    /// Register a listener for local and remote mutations.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&MapChange<K>) + Send + Sync + 'static,
    {
        self.changed.subscribe(listener)
    }

    /// Apply a mutation produced by another replica.
    pub fn apply_remote(&self, delta: &Delta) -> Result<(), MapError> {
        let op = self.decode(delta)?;

        let change = {
            let mut state = self.write();
            if state.pending.contains_key(op.key()) {
                log::trace!(
                    "map {}: remote write to {} superseded by pending local write",
                    self.name,
                    delta.key
                );
                return Ok(());
            }
            match op {
                MapOp::Set { key, value } => {
                    state.entries.insert(key.clone(), value);
                    Some(MapChange {
                        key,
                        kind: ChangeKind::Set,
                        origin: ChangeOrigin::Remote,
                    })
                }
                MapOp::Delete { key } => state.entries.remove(&key).map(|_| MapChange {
                    key,
                    kind: ChangeKind::Delete,
                    origin: ChangeOrigin::Remote,
                }),
            }
        };

        if let Some(change) = change {
            self.changed.emit(&change);
        }
        Ok(())
    }

    /// Record that the transport has sequenced one of this replica's deltas.
    pub fn acknowledge(&self, delta: &Delta) -> Result<(), MapError> {
        self.settle(delta).map(|_| ())
    }

    /// Give up on one of this replica's deltas that never reached the
    /// transport.
    ///
    /// The local value stays, but the key stops shadowing remote writes, so
    /// the next remote write to it brings this replica back in line.
    pub fn abandon(&self, delta: &Delta) -> Result<(), MapError> {
        if self.settle(delta)? {
            log::warn!(
                "map {}: write {} to {} was never sent; this replica differs until the key changes remotely",
                self.name,
                delta.client_seq,
                delta.key
            );
        }
        Ok(())
    }

    /// Clear the pending marker `delta` set, unless a newer write replaced it.
    fn settle(&self, delta: &Delta) -> Result<bool, MapError> {
        self.check_map(delta)?;
        let key: K = serde_json::from_str(&delta.key).map_err(|e| MapError::Decode {
            map: self.name.clone(),
            reason: e.to_string(),
        })?;

        let mut state = self.write();
        if state.pending.get(&key) == Some(&delta.client_seq) {
            state.pending.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    fn publish(&self, client_seq: u64, op: MapOp<K, V>) {
        let encoded = serde_json::to_string(op.key())
            .and_then(|key| serde_json::to_vec(&op).map(|op| (key, op)));
        match encoded {
            Ok((key, op)) => self.outbound.publish(Delta {
                map: self.name.clone(),
                key,
                client_seq,
                op,
            }),
            Err(e) => log::error!("map {}: failed to encode delta: {e}", self.name),
        }
    }

    fn decode(&self, delta: &Delta) -> Result<MapOp<K, V>, MapError> {
        self.check_map(delta)?;
        serde_json::from_slice(&delta.op).map_err(|e| MapError::Decode {
            map: self.name.clone(),
            reason: e.to_string(),
        })
    }

    fn check_map(&self, delta: &Delta) -> Result<(), MapError> {
        if delta.map != self.name {
            return Err(MapError::WrongMap {
                expected: self.name.clone(),
                found: delta.map.clone(),
            });
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, MapState<K, V>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MapState<K, V>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Delta>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Delta> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Broadcaster for Recorder {
        fn publish(&self, delta: Delta) {
            self.sent.lock().unwrap().push(delta);
        }
    }

    fn map() -> (ReplicatedMap<String, String>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (ReplicatedMap::new("notes", recorder.clone()), recorder)
    }

    fn changes(map: &ReplicatedMap<String, String>) -> (Arc<Mutex<Vec<MapChange<String>>>>, Subscription) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let sub = map.subscribe(move |c| sink.lock().unwrap().push(c.clone()));
        (log, sub)
    }

    #[test]
    fn test_set_get_has() {
        let (map, _) = map();
        map.set("a".into(), "1".into());
        assert_eq!(map.get(&"a".into()), Some("1".to_string()));
        assert!(map.has(&"a".into()));
        assert!(!map.has(&"b".into()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_set_overwrites() {
        let (map, _) = map();
        map.set("a".into(), "1".into());
        map.set("a".into(), "2".into());
        assert_eq!(map.get(&"a".into()), Some("2".to_string()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_set_publishes_and_fires_local_change() {
        let (map, recorder) = map();
        let (log, _sub) = changes(&map);

        map.set("a".into(), "1".into());

        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].map, "notes");
        assert_eq!(sent[0].key, "\"a\"");
        assert_eq!(sent[0].client_seq, 1);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, ChangeKind::Set);
        assert_eq!(log[0].origin, ChangeOrigin::Local);
    }

    #[test]
    fn test_delete_absent_is_noop() {
        let (map, recorder) = map();
        let (log, _sub) = changes(&map);

        map.delete(&"missing".into());

        assert!(recorder.take().is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_delete_present_publishes() {
        let (map, recorder) = map();
        map.set("a".into(), "1".into());
        recorder.take();

        map.delete(&"a".into());
        assert!(!map.has(&"a".into()));
        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        let op: MapOp<String, String> = serde_json::from_slice(&sent[0].op).unwrap();
        assert_eq!(op, MapOp::Delete { key: "a".into() });
    }

    #[test]
    fn test_remote_apply_fires_remote_change() {
        let (origin, recorder) = map();
        let (replica, _) = map();
        let (log, _sub) = changes(&replica);

        origin.set("a".into(), "1".into());
        for delta in recorder.take() {
            replica.apply_remote(&delta).unwrap();
        }

        assert_eq!(replica.get(&"a".into()), Some("1".to_string()));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].origin, ChangeOrigin::Remote);
    }

    #[test]
    fn test_remote_delete_of_absent_key_is_silent() {
        let (origin, recorder) = map();
        let (replica, _) = map();
        origin.set("a".into(), "1".into());
        origin.delete(&"a".into());
        let sent = recorder.take();

        let (log, _sub) = changes(&replica);
        replica.apply_remote(&sent[1]).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pending_local_write_shadows_remote() {
        let (a, a_out) = map();
        let (b, b_out) = map();

        // Concurrent writes; transport sequences a's write first, then b's.
        a.set("k".into(), "from-a".into());
        b.set("k".into(), "from-b".into());
        let da = a_out.take().remove(0);
        let db = b_out.take().remove(0);

        a.acknowledge(&da).unwrap();
        a.apply_remote(&db).unwrap();

        b.apply_remote(&da).unwrap(); // ignored: b's own write is pending
        b.acknowledge(&db).unwrap();

        assert_eq!(a.get(&"k".into()), Some("from-b".to_string()));
        assert_eq!(b.get(&"k".into()), Some("from-b".to_string()));
        assert_eq!(a.pending_len(), 0);
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn test_stale_ack_keeps_newer_pending() {
        let (map, recorder) = map();
        map.set("k".into(), "1".into());
        map.set("k".into(), "2".into());
        let sent = recorder.take();

        map.acknowledge(&sent[0]).unwrap();
        assert_eq!(map.pending_len(), 1);
        map.acknowledge(&sent[1]).unwrap();
        assert_eq!(map.pending_len(), 0);
    }

    #[test]
    fn test_toggle_alternates_in_one_step() {
        let (map, recorder) = map();
        let (log, _sub) = changes(&map);

        assert_eq!(map.toggle("k".into(), || "v".into()), ChangeKind::Set);
        assert_eq!(map.get(&"k".into()), Some("v".to_string()));
        assert_eq!(map.toggle("k".into(), || unreachable!()), ChangeKind::Delete);
        assert!(!map.has(&"k".into()));

        let ops: Vec<MapOp<String, String>> = recorder
            .take()
            .iter()
            .map(|d| serde_json::from_slice(&d.op).unwrap())
            .collect();
        assert_eq!(
            ops,
            vec![
                MapOp::Set { key: "k".into(), value: "v".into() },
                MapOp::Delete { key: "k".into() },
            ]
        );
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(map.pending_len(), 1);
    }

    #[test]
    fn test_toggle_sees_remote_delete() {
        let (origin, origin_out) = map();
        let (replica, replica_out) = map();
        origin.set("k".into(), "v".into());
        let set = origin_out.take().remove(0);
        replica.apply_remote(&set).unwrap();
        origin.delete(&"k".into());
        replica.apply_remote(&origin_out.take().remove(0)).unwrap();

        // The key vanished remotely, so the toggle adds it back.
        assert_eq!(replica.toggle("k".into(), || "again".into()), ChangeKind::Set);
        assert_eq!(replica_out.take().len(), 1);
        assert_eq!(replica.get(&"k".into()), Some("again".to_string()));
    }

    #[test]
    fn test_abandoned_write_stops_shadowing() {
        let (local, local_out) = map();
        let (remote, remote_out) = map();

        local.set("k".into(), "lost".into());
        let lost = local_out.take().remove(0);
        remote.set("k".into(), "kept".into());
        let kept = remote_out.take().remove(0);

        local.abandon(&lost).unwrap();
        assert_eq!(local.pending_len(), 0);
        local.apply_remote(&kept).unwrap();
        assert_eq!(local.get(&"k".into()), Some("kept".to_string()));
    }

    #[test]
    fn test_abandon_keeps_newer_pending() {
        let (map, recorder) = map();
        map.set("k".into(), "1".into());
        map.set("k".into(), "2".into());
        let sent = recorder.take();

        map.abandon(&sent[0]).unwrap();
        assert_eq!(map.pending_len(), 1);
    }

    #[test]
    fn test_wrong_map_rejected() {
        let (map, _) = map();
        let delta = Delta {
            map: "ballots".into(),
            key: "\"a\"".into(),
            client_seq: 1,
            op: Vec::new(),
        };
        assert!(matches!(map.apply_remote(&delta), Err(MapError::WrongMap { .. })));
        assert!(matches!(map.acknowledge(&delta), Err(MapError::WrongMap { .. })));
        assert!(matches!(map.abandon(&delta), Err(MapError::WrongMap { .. })));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let (map, _) = map();
        let delta = Delta {
            map: "notes".into(),
            key: "\"a\"".into(),
            client_seq: 1,
            op: vec![0xFF, 0x00],
        };
        assert!(matches!(map.apply_remote(&delta), Err(MapError::Decode { .. })));
        assert!(map.is_empty());
    }

    #[test]
    fn test_entries_snapshot() {
        let (map, _) = map();
        map.set("a".into(), "1".into());
        map.set("b".into(), "2".into());
        let mut entries = map.entries();
        entries.sort();
        assert_eq!(
            entries,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
        let mut keys = map.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
