//! A participant's live board: replicated stores wired to the relay.
//!
//! ```text
//!  BoardEngine ──► BoardStores ──publish──► ChannelBroadcaster ──► forward task ──► SyncClient
//!                       ▲                                                             │
//!                       └──── apply_remote / acknowledge ◄──── pump task ◄── SyncEvent┘
//! ```
//!
//! `open` waits for the first catch-up before joining, so the identity
//! check sees the users already on the board.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use notero_core::{
    BoardEngine, BoardStores, Broadcaster, ChangeNotifier, Delta, IdentityManager, SessionStore,
};

use crate::client::{ConnectionState, ReconnectPolicy, SyncClient, SyncEvent, SyncStatus};
use crate::protocol::{PeerInfo, ProtocolError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay URL, without the board path
    pub server_url: String,
    pub board_id: Uuid,
    /// Name announced to other peers
    pub peer_name: String,
    /// How long `open` waits for the first catch-up
    pub sync_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub offline_queue_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            board_id: Uuid::nil(),
            peer_name: "anonymous".to_string(),
            sync_timeout_ms: 5_000,
            heartbeat_interval_secs: 10,
            offline_queue_capacity: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("relay unreachable: {0}")]
    Connect(#[from] ProtocolError),
    #[error("no catch-up from relay within {0:?}")]
    SyncTimeout(Duration),
    #[error("connection closed before catch-up")]
    Closed,
}

/// Hands local deltas to the forward task without blocking the map.
struct ChannelBroadcaster {
    tx: mpsc::UnboundedSender<Delta>,
}

impl Broadcaster for ChannelBroadcaster {
    fn publish(&self, delta: Delta) {
        if self.tx.send(delta).is_err() {
            log::warn!("Session closed, local write stays on this replica");
        }
    }
}

pub struct BoardSession {
    engine: Arc<BoardEngine>,
    notifier: ChangeNotifier,
    client: Arc<Mutex<SyncClient>>,
    status: SyncStatus,
    closing: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BoardSession {
    /// Connect, catch up, then join the board under the stored identity.
    pub async fn open<S: SessionStore>(
        config: SessionConfig,
        identity: &mut IdentityManager<S>,
    ) -> Result<Self, SessionError> {
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let stores = Arc::new(BoardStores::new(Arc::new(ChannelBroadcaster { tx: delta_tx })));
        let notifier = ChangeNotifier::new(&stores);

        let mut client = SyncClient::with_queue_capacity(
            PeerInfo::new(config.peer_name.clone()),
            config.board_id,
            config.server_url.clone(),
            config.offline_queue_capacity,
        );
        let events = client.take_event_rx().ok_or(SessionError::Closed)?;
        client.connect().await?;
        let status = client.status();
        let client = Arc::new(Mutex::new(client));

        let closing = Arc::new(AtomicBool::new(false));
        let (synced_tx, mut synced_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(pump(
                events,
                stores.clone(),
                client.clone(),
                closing.clone(),
                config.reconnect.clone(),
                synced_tx,
            )),
            tokio::spawn(forward(delta_rx, client.clone(), stores.clone())),
            tokio::spawn(heartbeat(
                client.clone(),
                Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            )),
        ];

        let timeout = Duration::from_millis(config.sync_timeout_ms);
        let outcome = tokio::time::timeout(timeout, synced_rx.wait_for(|synced| *synced))
            .await
            .map(|waited| waited.map(|_| ()));
        let failure = match outcome {
            Ok(Ok(_)) => None,
            Ok(Err(_)) => Some(SessionError::Closed),
            Err(_) => Some(SessionError::SyncTimeout(timeout)),
        };
        if let Some(e) = failure {
            closing.store(true, Ordering::SeqCst);
            for task in &tasks {
                task.abort();
            }
            return Err(e);
        }

        let engine = Arc::new(BoardEngine::join(stores, identity));
        log::info!(
            "Joined board {} as {}",
            config.board_id,
            engine.current_user().name
        );

        Ok(Self {
            engine,
            notifier,
            client,
            status,
            closing,
            tasks,
        })
    }

    pub fn engine(&self) -> &Arc<BoardEngine> {
        &self.engine
    }

    /// Change signal for the presentation layer.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.status.connection_state().await
    }

    /// Local writes the relay has not acknowledged yet.
    pub async fn unacknowledged(&self) -> usize {
        self.status.unacknowledged().await
    }

    /// Highest relay sequence applied to this replica.
    pub async fn last_seen(&self) -> u64 {
        self.status.last_seen()
    }

    /// Leave the board. Unacknowledged writes are dropped.
    pub async fn close(mut self) {
        self.shutdown();
        self.client.lock().await.close().await;
    }

    fn shutdown(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for BoardSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Feeds relay events into the stores and keeps the connection alive.
async fn pump(
    mut events: mpsc::Receiver<SyncEvent>,
    stores: Arc<BoardStores>,
    client: Arc<Mutex<SyncClient>>,
    closing: Arc<AtomicBool>,
    policy: ReconnectPolicy,
    synced: watch::Sender<bool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::RemoteDelta {
                sequence, delta, ..
            } => {
                if let Err(e) = stores.apply_remote(&delta) {
                    log::warn!("Skipping remote delta {sequence}: {e}");
                }
            }
            SyncEvent::Acknowledged { sequence, delta } => {
                if let Err(e) = stores.acknowledge(&delta) {
                    log::warn!("Skipping acknowledgement {sequence}: {e}");
                }
            }
            SyncEvent::StateSynced { sequence } => {
                log::debug!("Replica caught up to {sequence}");
                synced.send_replace(true);
            }
            SyncEvent::Connected => log::debug!("Relay connection open"),
            SyncEvent::PeerJoined(info) => log::info!("{} joined the board", info.name),
            SyncEvent::PeerLeft(peer_id) => log::info!("Peer {peer_id} left the board"),
            SyncEvent::Disconnected => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("Lost connection to relay");
                if let Err(e) = reconnect(&client, &policy, &closing).await {
                    log::error!("Relay unreachable, working offline: {e}");
                    break;
                }
            }
        }
    }
}

/// Backs off with the client unlocked, so queries and local writes go on
/// while the relay is away.
async fn reconnect(
    client: &Mutex<SyncClient>,
    policy: &ReconnectPolicy,
    closing: &AtomicBool,
) -> Result<(), ProtocolError> {
    client.lock().await.begin_reconnect().await;
    let mut attempt = 0u32;
    while !closing.load(Ordering::SeqCst) {
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            client.lock().await.close().await;
            return Err(ProtocolError::ConnectionClosed);
        }

        let delay = policy.delay_for(attempt);
        log::info!("Reconnecting in {}ms (attempt {})", delay.as_millis(), attempt + 1);
        tokio::time::sleep(delay).await;

        match client.lock().await.try_reconnect().await {
            Ok(()) => return Ok(()),
            Err(e) => log::warn!("Reconnect attempt {} failed: {e}", attempt + 1),
        }
        attempt += 1;
    }
    Ok(())
}

async fn forward(
    mut deltas: mpsc::UnboundedReceiver<Delta>,
    client: Arc<Mutex<SyncClient>>,
    stores: Arc<BoardStores>,
) {
    while let Some(delta) = deltas.recv().await {
        let sent = client.lock().await.send_delta(delta.clone()).await;
        if let Err(e) = sent {
            log::error!("Local write {} not sent: {e}", delta.client_seq);
            if let Err(e) = stores.abandon(&delta) {
                log::warn!("Could not release write {}: {e}", delta.client_seq);
            }
        }
    }
}

async fn heartbeat(client: Arc<Mutex<SyncClient>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = client.lock().await.send_ping().await {
            log::debug!("Heartbeat skipped: {e}");
        }
    }
}
