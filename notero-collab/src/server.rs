//! WebSocket relay with room-based board routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (board_id) ── BoardHistory ── BroadcastGroup
//! Client B ──┘                            │
//!                          ┌──────────────┼──────────────┐
//!                          ▼              ▼              ▼
//!                       Client A       Client B       Client C
//! ```
//!
//! The relay never interprets map operations. It assigns each delta the
//! next sequence number of its board and echoes it to every peer, the
//! sender included. That echo is the sender's acknowledgement.
//!
//! Connection lifecycle:
//! 1. `PeerJoined` picks the room and is announced to the other peers
//! 2. `SyncStep1(last_seen)` is answered with `SyncStep2` and subscribes
//!    the connection to the live feed
//! 3. `Delta` messages are sequenced and fanned out
//! 4. On close, `PeerLeft` is announced; the room and its history stay

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::room::{BoardRoom, RoomManager};

type ConnectionError = Box<dyn std::error::Error + Send + Sync>;

/// Who a connection speaks for, once it has joined a board.
#[derive(Default)]
struct PeerSlot {
    peer: Option<PeerInfo>,
    room: Option<Arc<BoardRoom>>,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Expected client heartbeat interval in seconds; a connection silent
    /// for three intervals is dropped
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub sequenced_deltas: u64,
    pub duplicate_deltas: u64,
    pub rejected_peers: u64,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ConnectionError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        Self::serve_peer(ws_sender, ws_receiver, addr, rooms, stats, config).await
    }

    /// Relay one peer's messages, then release its place in the room
    /// however the connection ended.
    async fn serve_peer<S, R>(
        mut ws_sender: S,
        mut ws_receiver: R,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ConnectionError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut slot = PeerSlot::default();
        let result = Self::relay_messages(
            &mut ws_sender,
            &mut ws_receiver,
            addr,
            &rooms,
            &stats,
            &config,
            &mut slot,
        )
        .await;

        // Cleanup: the room and its history stay for the next joiner
        if let (Some(info), Some(r)) = (slot.peer, slot.room) {
            r.leave(&info.peer_id).await;
            if let Err(e) = r.announce(&SyncMessage::peer_left(info.peer_id, r.board_id())) {
                log::warn!("Failed to announce departure of {}: {e}", info.name);
            }
            log::info!("Peer {} left board {}", info.name, r.board_id());
        }

        stats.write().await.active_connections -= 1;
        result
    }

    async fn relay_messages<S, R>(
        ws_sender: &mut S,
        ws_receiver: &mut R,
        addr: SocketAddr,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
        slot: &mut PeerSlot,
    ) -> Result<(), ConnectionError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let idle_timeout = Duration::from_secs(config.heartbeat_interval_secs.max(1) * 3);
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::PeerJoined => {
                                    let info = sync_msg.peer_info().unwrap_or_else(|_| {
                                        PeerInfo::with_id(sync_msg.peer_id, "Anonymous")
                                    });
                                    let r = rooms.get_or_create(sync_msg.board_id).await;

                                    if r.peer_count().await >= config.max_peers_per_room {
                                        log::warn!(
                                            "Board {} is full ({} peers), rejecting {}",
                                            sync_msg.board_id,
                                            config.max_peers_per_room,
                                            info.name
                                        );
                                        stats.write().await.rejected_peers += 1;
                                        let _ = ws_sender.send(Message::Close(None)).await;
                                        break;
                                    }

                                    r.announce(&SyncMessage::peer_joined(r.board_id(), &info)?)?;
                                    log::info!(
                                        "Peer {} ({}) joined board {}",
                                        info.name,
                                        info.peer_id,
                                        r.board_id()
                                    );
                                    stats.write().await.active_rooms = rooms.room_count().await;
                                    slot.peer = Some(info);
                                    slot.room = Some(r);
                                }

                                MessageType::SyncStep1 => {
                                    let (Some(info), Some(r)) = (&slot.peer, &slot.room) else {
                                        log::warn!("SyncStep1 before PeerJoined from {addr}");
                                        continue;
                                    };
                                    let catch_up = r.catch_up(info.clone(), sync_msg.clock).await;
                                    log::debug!(
                                        "Catching up {} from {} to {} ({} deltas)",
                                        info.name,
                                        sync_msg.clock,
                                        catch_up.head,
                                        catch_up.entries.len()
                                    );
                                    broadcast_rx = Some(catch_up.receiver);

                                    let response = SyncMessage::sync_step2(
                                        r.board_id(),
                                        catch_up.head,
                                        &catch_up.entries,
                                    )?;
                                    ws_sender.send(Message::Binary(response.encode()?.into())).await?;
                                }

                                MessageType::Delta => {
                                    let (Some(info), Some(r)) = (&slot.peer, &slot.room) else {
                                        log::warn!("Delta before PeerJoined from {addr}");
                                        continue;
                                    };
                                    let delta = match sync_msg.delta_payload() {
                                        Ok(d) => d,
                                        Err(e) => {
                                            log::warn!("Bad delta from {}: {e}", info.name);
                                            continue;
                                        }
                                    };
                                    match r.record(info.peer_id, delta).await? {
                                        Some(entry) => {
                                            log::trace!("Sequenced delta {} on board {}", entry.sequence, r.board_id());
                                            stats.write().await.sequenced_deltas += 1;
                                        }
                                        None => {
                                            log::debug!(
                                                "Dropped resent delta {} from {}",
                                                sync_msg.clock,
                                                info.name
                                            );
                                            stats.write().await.duplicate_deltas += 1;
                                        }
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(sync_msg.peer_id);
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast message
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // Not subscribed until SyncStep1
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // The peer missed sequenced deltas; it recovers
                            // through SyncStep1 after reconnecting.
                            if let Some(r) = &slot.room {
                                r.broadcast().record_dropped(n);
                            }
                            log::warn!("Peer at {addr} lagged by {n} messages, disconnecting");
                            ws_sender.send(Message::Close(None)).await?;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = &mut idle => {
                    log::info!("Connection from {addr} idle for {}s, closing", idle_timeout.as_secs());
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_peers_per_room: 50,
            broadcast_capacity: 512,
            heartbeat_interval_secs: 15,
        };
        let server = SyncServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(server.config().max_peers_per_room, 50);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.sequenced_deltas, 0);
        assert_eq!(stats.duplicate_deltas, 0);
        assert_eq!(stats.rejected_peers, 0);
    }

    #[tokio::test]
    async fn test_failed_send_still_releases_peer() {
        let board_id = Uuid::new_v4();
        let info = PeerInfo::new("Alice");
        let incoming = vec![
            Ok(Message::Binary(
                SyncMessage::peer_joined(board_id, &info).unwrap().encode().unwrap().into(),
            )),
            Ok(Message::Binary(
                SyncMessage::sync_step1(info.peer_id, board_id, 0).encode().unwrap().into(),
            )),
        ];
        // The socket is gone: every write fails.
        let outgoing = Box::pin(futures_util::sink::unfold((), |_, _msg: Message| async {
            Err::<(), WsError>(WsError::ConnectionClosed)
        }));

        let rooms = Arc::new(RoomManager::new(16));
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let result = SyncServer::serve_peer(
            outgoing,
            futures_util::stream::iter(incoming),
            "127.0.0.1:4000".parse().unwrap(),
            rooms.clone(),
            stats.clone(),
            ServerConfig::default(),
        )
        .await;

        assert!(result.is_err());
        let room = rooms.get(&board_id).await.unwrap();
        assert_eq!(room.peer_count().await, 0);
        let stats = stats.read().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn test_server_starts_without_rooms() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.room_manager().room_count().await, 0);
    }
}
