//! Board rooms: one delta log plus one broadcast group per board.
//!
//! ```text
//!            record()                      catch_up()
//! Delta ──► history.lock ──► append ──► broadcast ──► every subscribed peer
//!                │
//!                └─ held while a joining peer snapshots `since(last_seen)`
//!                   and subscribes, so each sequence reaches it exactly once
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use notero_core::Delta;

use crate::broadcast::BroadcastGroup;
use crate::history::BoardHistory;
use crate::protocol::{PeerInfo, ProtocolError, SequencedDelta, SyncMessage};

/// What a peer receives when it (re)subscribes to a room.
pub struct CatchUp {
    /// Entries after the peer's last seen sequence
    pub entries: Vec<SequencedDelta>,
    /// Relay head at subscription time
    pub head: u64,
    /// Live feed of everything sequenced after `head`
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
}

pub struct BoardRoom {
    board_id: Uuid,
    history: Mutex<BoardHistory>,
    broadcast: BroadcastGroup,
}

impl BoardRoom {
    pub fn new(board_id: Uuid, broadcast_capacity: usize) -> Self {
        Self {
            board_id,
            history: Mutex::new(BoardHistory::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    /// Subscribe `peer` and collect what it missed after `last_seen`.
    pub async fn catch_up(&self, peer: PeerInfo, last_seen: u64) -> CatchUp {
        let history = self.history.lock().await;
        let receiver = self.broadcast.add_peer(peer).await;
        CatchUp {
            entries: history.since(last_seen),
            head: history.head(),
            receiver,
        }
    }

    /// Sequence a delta and fan it out to every subscriber, origin included.
    ///
    /// Returns `Ok(None)` when the delta was already sequenced.
    pub async fn record(
        &self,
        origin: Uuid,
        delta: Delta,
    ) -> Result<Option<SequencedDelta>, ProtocolError> {
        let mut history = self.history.lock().await;
        let Some(entry) = history.record(origin, delta) else {
            return Ok(None);
        };
        self.broadcast
            .broadcast(&SyncMessage::sequenced(self.board_id, &entry)?)?;
        Ok(Some(entry))
    }

    /// Fan out a presence message.
    pub fn announce(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        self.broadcast.broadcast(msg)
    }

    pub async fn leave(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.broadcast.remove_peer(peer_id).await
    }

    pub async fn head(&self) -> u64 {
        self.history.lock().await.head()
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.broadcast.peer_count().await
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }
}

/// Routes boards to their rooms.
///
/// Rooms outlive their peers: the history is the only copy of a board, so
/// an empty room is kept for the next joiner.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<Uuid, Arc<BoardRoom>>>>,
    broadcast_capacity: usize,
}

impl RoomManager {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            broadcast_capacity,
        }
    }

    /// Get or create the room for `board_id`.
    pub async fn get_or_create(&self, board_id: Uuid) -> Arc<BoardRoom> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&board_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another connection may have created it meanwhile
        if let Some(room) = rooms.get(&board_id) {
            return room.clone();
        }

        log::info!("Opening room for board {board_id}");
        let room = Arc::new(BoardRoom::new(board_id, self.broadcast_capacity));
        rooms.insert(board_id, room.clone());
        room
    }

    pub async fn get(&self, board_id: &Uuid) -> Option<Arc<BoardRoom>> {
        self.rooms.read().await.get(board_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_boards(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn delta(client_seq: u64) -> Delta {
        Delta {
            map: "notes".into(),
            key: "\"n-1\"".into(),
            client_seq,
            op: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let board_id = Uuid::new_v4();

        let room1 = manager.get_or_create(board_id).await;
        let room2 = manager.get_or_create(board_id).await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(room1.board_id(), board_id);
    }

    #[tokio::test]
    async fn test_room_manager_multiple_boards() {
        let manager = RoomManager::new(16);
        let board1 = Uuid::new_v4();
        let board2 = Uuid::new_v4();

        let _room1 = manager.get_or_create(board1).await;
        let _room2 = manager.get_or_create(board2).await;

        assert_eq!(manager.room_count().await, 2);
        let boards = manager.active_boards().await;
        assert!(boards.contains(&board1));
        assert!(boards.contains(&board2));
        assert!(manager.get(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_room_is_retained() {
        let manager = RoomManager::new(16);
        let board_id = Uuid::new_v4();
        let room = manager.get_or_create(board_id).await;

        let peer = PeerInfo::new("Alice");
        let _feed = room.catch_up(peer.clone(), 0).await;
        room.record(peer.peer_id, delta(1)).await.unwrap();
        room.leave(&peer.peer_id).await;

        assert_eq!(room.peer_count().await, 0);
        let again = manager.get(&board_id).await.unwrap();
        assert_eq!(again.head().await, 1);
    }

    #[tokio::test]
    async fn test_record_reaches_origin() {
        let room = BoardRoom::new(Uuid::new_v4(), 16);
        let peer = PeerInfo::new("Alice");
        let mut feed = room.catch_up(peer.clone(), 0).await;

        let entry = room.record(peer.peer_id, delta(1)).await.unwrap().unwrap();
        assert_eq!(entry.sequence, 1);

        let msg = SyncMessage::decode(&feed.receiver.recv().await.unwrap()).unwrap();
        assert_eq!(msg.msg_type, MessageType::Delta);
        assert_eq!(msg.peer_id, peer.peer_id);
        assert_eq!(msg.sequence, 1);
    }

    #[tokio::test]
    async fn test_duplicate_is_not_broadcast() {
        let room = BoardRoom::new(Uuid::new_v4(), 16);
        let peer = PeerInfo::new("Alice");
        let mut feed = room.catch_up(peer.clone(), 0).await;

        assert!(room.record(peer.peer_id, delta(1)).await.unwrap().is_some());
        assert!(room.record(peer.peer_id, delta(1)).await.unwrap().is_none());

        let _ = feed.receiver.recv().await.unwrap();
        assert!(feed.receiver.try_recv().is_err());
        assert_eq!(room.history_len().await, 1);
    }

    #[tokio::test]
    async fn test_catch_up_splits_history_from_live_feed() {
        let room = BoardRoom::new(Uuid::new_v4(), 16);
        let writer = Uuid::new_v4();
        for seq in 1..=3 {
            room.record(writer, delta(seq)).await.unwrap();
        }

        let mut late = room.catch_up(PeerInfo::new("Late"), 1).await;
        let sequences: Vec<u64> = late.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
        assert_eq!(late.head, 3);
        assert!(late.receiver.try_recv().is_err());

        room.record(writer, delta(4)).await.unwrap();
        let msg = SyncMessage::decode(&late.receiver.recv().await.unwrap()).unwrap();
        assert_eq!(msg.sequence, 4);
    }
}
