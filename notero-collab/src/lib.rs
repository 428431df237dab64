//! # notero-collab: relay transport for notero boards
//!
//! Carries `notero-core` deltas between participants over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ BoardSession │ ◄─────────────────► │ SyncServer   │
//! │ (per user)   │     Binary Proto    │ (relay)      │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ BoardStores  │                     │ BoardHistory │
//! │ (replica)    │                     │ (sequencer)  │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │ BroadcastGroup│
//!                                     │ (fan-out)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`history`]: Per-board sequencing and catch-up log
//! - [`broadcast`]: Fan-out with lag accounting
//! - [`room`]: Board rooms and their routing
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket client with offline queue and reconnect
//! - [`session`]: A joined board wired to the relay

pub mod protocol;
pub mod history;
pub mod broadcast;
pub mod room;
pub mod server;
pub mod client;
pub mod session;

// Re-exports for convenience
pub use protocol::{MessageType, PeerInfo, ProtocolError, SequencedDelta, SyncMessage};
pub use history::BoardHistory;
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use room::{BoardRoom, CatchUp, RoomManager};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{
    ConnectionState, OfflineQueue, ReconnectPolicy, SyncClient, SyncEvent, SyncStatus,
};
pub use session::{BoardSession, SessionConfig, SessionError};
