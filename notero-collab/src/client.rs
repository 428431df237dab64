//! WebSocket sync client for connecting to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, close, reconnect with backoff)
//! - Catch-up from the last seen relay sequence
//! - An offline queue holding every delta until the relay echoes it back
//!
//! Deltas written while disconnected, or while the catch-up is still in
//! flight, wait in the queue. Once `SyncStep2` has been processed, every
//! queued delta the catch-up did not acknowledge is resent in order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use notero_core::Delta;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SequencedDelta, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, waiting for the catch-up
    Syncing,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A delta sequenced for another peer
    RemoteDelta {
        peer_id: Uuid,
        sequence: u64,
        delta: Delta,
    },
    /// One of our own deltas came back sequenced
    Acknowledged { sequence: u64, delta: Delta },
    /// Catch-up processed; `sequence` is the relay head it covered
    StateSynced { sequence: u64 },
    /// A peer joined the board
    PeerJoined(PeerInfo),
    /// A peer left the board
    PeerLeft(Uuid),
}

/// Backoff for [`SyncClient::reconnect`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 10_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (0-based), doubling up to the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Deltas not yet acknowledged by the relay.
///
/// Entries leave the queue only when their echo arrives, so anything lost
/// with a dropped connection is resent after the next catch-up.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    delta: Delta,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta. Returns false when full.
    pub fn enqueue(&mut self, delta: Delta) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta {
            delta,
            queued_at: Instant::now(),
        });
        true
    }

    /// Drop the entry the relay just echoed back.
    pub fn acknowledge(&mut self, map: &str, client_seq: u64) -> bool {
        match self
            .queue
            .iter()
            .position(|q| q.delta.client_seq == client_seq && q.delta.map == map)
        {
            Some(idx) => {
                self.queue.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Queued deltas in send order.
    pub fn pending(&self) -> Vec<Delta> {
        self.queue.iter().map(|q| q.delta.clone()).collect()
    }

    /// Age of the oldest unacknowledged delta.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|q| q.queued_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total operation bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.delta.op.len()).sum()
    }
}

/// State shared between the client handle and its reader task.
#[derive(Clone)]
struct Shared {
    peer_id: Uuid,
    board_id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    last_seen: Arc<AtomicU64>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

/// The sync client.
///
/// Manages a WebSocket connection to the relay for one board.
pub struct SyncClient {
    peer_info: PeerInfo,
    server_url: String,
    shared: Shared,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, board_id: Uuid, server_url: impl Into<String>) -> Self {
        Self::with_queue_capacity(peer_info, board_id, server_url, 10_000)
    }

    pub fn with_queue_capacity(
        peer_info: PeerInfo,
        board_id: Uuid,
        server_url: impl Into<String>,
        queue_capacity: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            shared: Shared {
                peer_id: peer_info.peer_id,
                board_id,
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                last_seen: Arc::new(AtomicU64::new(0)),
                offline_queue: Arc::new(Mutex::new(OfflineQueue::new(queue_capacity))),
                event_tx,
            },
            peer_info,
            server_url: server_url.into(),
            outgoing_tx: None,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages and
    /// requests every delta after the last sequence seen.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.shared.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.shared.board_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(ok) => ok,
            Err(e) => {
                log::debug!("Connect to {url} failed: {e}");
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            // Handle dropped: close politely
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let join = SyncMessage::peer_joined(self.shared.board_id, &self.peer_info)?.encode()?;
        let last_seen = self.shared.last_seen.load(Ordering::SeqCst);
        let step1 =
            SyncMessage::sync_step1(self.peer_info.peer_id, self.shared.board_id, last_seen)
                .encode()?;
        for msg in [join, step1] {
            out_tx
                .send(msg)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        let weak_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);

        *self.shared.state.write().await = ConnectionState::Syncing;
        let _ = self.shared.event_tx.send(SyncEvent::Connected).await;
        log::info!(
            "Connected to {url} as {}, catching up from {last_seen}",
            self.peer_info.name
        );

        // Reader task: process incoming WebSocket messages. It holds the
        // writer weakly so close() can end the connection.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => shared.handle_message(sync_msg, &weak_tx).await,
                            Err(e) => log::warn!("Failed to decode relay message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *shared.state.write().await = ConnectionState::Disconnected;
            let _ = shared.event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Reconnect with exponential backoff.
    ///
    /// Holds `&mut self` for the whole backoff. Callers sharing the client
    /// should drive [`begin_reconnect`](Self::begin_reconnect) and
    /// [`try_reconnect`](Self::try_reconnect) themselves.
    pub async fn reconnect(&mut self, policy: &ReconnectPolicy) -> Result<(), ProtocolError> {
        self.begin_reconnect().await;
        let mut attempt = 0u32;
        loop {
            if policy.max_attempts.is_some_and(|max| attempt >= max) {
                log::error!("Giving up on {} after {attempt} attempts", self.server_url);
                self.close().await;
                return Err(ProtocolError::ConnectionClosed);
            }

            let delay = policy.delay_for(attempt);
            log::info!("Reconnecting in {}ms (attempt {})", delay.as_millis(), attempt + 1);
            tokio::time::sleep(delay).await;

            match self.try_reconnect().await {
                Ok(()) => return Ok(()),
                Err(e) => log::warn!("Reconnect attempt {} failed: {e}", attempt + 1),
            }
            attempt += 1;
        }
    }

    /// Drop the current connection and enter `Reconnecting`.
    pub async fn begin_reconnect(&mut self) {
        self.outgoing_tx = None;
        *self.shared.state.write().await = ConnectionState::Reconnecting;
    }

    /// One reconnect attempt. A failed attempt leaves the client
    /// `Reconnecting`.
    pub async fn try_reconnect(&mut self) -> Result<(), ProtocolError> {
        let result = self.connect().await;
        if result.is_err() {
            *self.shared.state.write().await = ConnectionState::Reconnecting;
        }
        result
    }

    /// Close the connection. Queued deltas are kept.
    pub async fn close(&mut self) {
        // Dropping the sender ends the writer task, which sends Close.
        self.outgoing_tx = None;
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }

    /// Send a delta to the relay.
    ///
    /// The delta is queued until acknowledged; it goes out right away only
    /// when the client is connected and caught up.
    pub async fn send_delta(&self, delta: Delta) -> Result<(), ProtocolError> {
        let mut queue = self.shared.offline_queue.lock().await;
        if !queue.enqueue(delta.clone()) {
            return Err(ProtocolError::QueueFull);
        }

        if *self.shared.state.read().await != ConnectionState::Connected {
            return Ok(());
        }

        let encoded =
            SyncMessage::delta(self.peer_info.peer_id, self.shared.board_id, &delta)?.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            if tx.send(encoded).await.is_err() {
                log::debug!("Writer gone; delta {} stays queued", delta.client_seq);
            }
        }
        Ok(())
    }

    /// Send a ping to the relay.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = SyncMessage::ping(self.peer_info.peer_id).encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn board_id(&self) -> Uuid {
        self.shared.board_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Highest relay sequence processed so far.
    pub fn last_seen(&self) -> u64 {
        self.shared.last_seen.load(Ordering::SeqCst)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.shared.offline_queue.lock().await.len()
    }

    /// A handle for reading the connection state without the client.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            state: self.shared.state.clone(),
            last_seen: self.shared.last_seen.clone(),
            offline_queue: self.shared.offline_queue.clone(),
        }
    }
}

/// Read-only view of a [`SyncClient`], usable while another task holds
/// the client itself.
#[derive(Clone)]
pub struct SyncStatus {
    state: Arc<RwLock<ConnectionState>>,
    last_seen: Arc<AtomicU64>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
}

impl SyncStatus {
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::SeqCst)
    }

    /// Deltas still waiting for the relay's echo.
    pub async fn unacknowledged(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

impl Shared {
    async fn handle_message(&self, msg: SyncMessage, out_tx: &mpsc::WeakSender<Vec<u8>>) {
        match msg.msg_type {
            MessageType::Delta => match msg.delta_payload() {
                Ok(delta) => {
                    self.deliver(SequencedDelta {
                        sequence: msg.sequence,
                        origin: msg.peer_id,
                        delta,
                    })
                    .await
                }
                Err(e) => log::warn!("Bad delta from relay: {e}"),
            },
            MessageType::SyncStep2 => match msg.sync_entries() {
                Ok(entries) => self.finish_catch_up(msg.sequence, entries, out_tx).await,
                Err(e) => log::warn!("Bad catch-up from relay: {e}"),
            },
            MessageType::PeerJoined if msg.peer_id != self.peer_id => {
                if let Ok(info) = msg.peer_info() {
                    let _ = self.event_tx.send(SyncEvent::PeerJoined(info)).await;
                }
            }
            MessageType::PeerLeft if msg.peer_id != self.peer_id => {
                let _ = self.event_tx.send(SyncEvent::PeerLeft(msg.peer_id)).await;
            }
            MessageType::Pong => log::trace!("Pong from relay"),
            _ => {}
        }
    }

    async fn deliver(&self, entry: SequencedDelta) {
        if entry.sequence <= self.last_seen.load(Ordering::SeqCst) {
            return;
        }
        self.last_seen.store(entry.sequence, Ordering::SeqCst);

        let event = if entry.origin == self.peer_id {
            self.offline_queue
                .lock()
                .await
                .acknowledge(&entry.delta.map, entry.delta.client_seq);
            SyncEvent::Acknowledged {
                sequence: entry.sequence,
                delta: entry.delta,
            }
        } else {
            SyncEvent::RemoteDelta {
                peer_id: entry.origin,
                sequence: entry.sequence,
                delta: entry.delta,
            }
        };
        let _ = self.event_tx.send(event).await;
    }

    async fn finish_catch_up(
        &self,
        head: u64,
        entries: Vec<SequencedDelta>,
        out_tx: &mpsc::WeakSender<Vec<u8>>,
    ) {
        let Some(out_tx) = out_tx.upgrade() else {
            return;
        };
        let caught_up = entries.len();
        for entry in entries {
            self.deliver(entry).await;
        }
        self.last_seen.fetch_max(head, Ordering::SeqCst);

        // Resend under the queue lock so send_delta cannot interleave.
        let queue = self.offline_queue.lock().await;
        let pending = queue.pending();
        if !pending.is_empty() {
            log::info!("Replaying {} unacknowledged deltas", pending.len());
        }
        for delta in &pending {
            match SyncMessage::delta(self.peer_id, self.board_id, delta).and_then(|m| m.encode()) {
                Ok(encoded) => {
                    if out_tx.send(encoded).await.is_err() {
                        return;
                    }
                }
                Err(e) => log::error!("Failed to encode queued delta: {e}"),
            }
        }
        *self.state.write().await = ConnectionState::Connected;
        drop(queue);

        log::debug!("Caught up with {caught_up} deltas, relay head {head}");
        let _ = self.event_tx.send(SyncEvent::StateSynced { sequence: head }).await;
    }
}
