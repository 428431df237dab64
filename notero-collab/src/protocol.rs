//! Binary protocol for board delta synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬───────────┬──────────┐
//! │ msg_type │ peer_id   │ board_id  │ clock    │ sequence  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes  │ varint   │ varint    │ variable │
//! └──────────┴───────────┴───────────┴──────────┴───────────┴──────────┘
//! ```
//!
//! `clock` carries the sender's per-map write counter on `Delta` and the
//! last sequence seen on `SyncStep1`. `sequence` is assigned by the relay.

use notero_core::Delta;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks for every delta after `clock`
    SyncStep1 = 1,
    /// Relay answers with the missed deltas
    SyncStep2 = 2,
    /// One map mutation
    Delta = 3,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Transport-level identity of a connected client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// A delta as recorded by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedDelta {
    pub sequence: u64,
    pub origin: Uuid,
    pub delta: Delta,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub board_id: Uuid,
    pub clock: u64,
    /// Relay-assigned position, 0 until sequenced
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create an unsequenced delta message.
    pub fn delta(peer_id: Uuid, board_id: Uuid, delta: &Delta) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Delta,
            peer_id,
            board_id,
            clock: delta.client_seq,
            sequence: 0,
            payload: encode_value(delta)?,
        })
    }

    /// Create the relay's broadcast of a recorded delta.
    pub fn sequenced(board_id: Uuid, entry: &SequencedDelta) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Delta,
            peer_id: entry.origin,
            board_id,
            clock: entry.delta.client_seq,
            sequence: entry.sequence,
            payload: encode_value(&entry.delta)?,
        })
    }

    /// Create a sync step 1 (catch-up request).
    pub fn sync_step1(peer_id: Uuid, board_id: Uuid, last_seen: u64) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            board_id,
            clock: last_seen,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    /// Create a sync step 2 (catch-up response). `sequence` is the relay head.
    pub fn sync_step2(
        board_id: Uuid,
        head: u64,
        entries: &[SequencedDelta],
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SyncStep2,
            peer_id: Uuid::nil(),
            board_id,
            clock: 0,
            sequence: head,
            payload: encode_value(&entries)?,
        })
    }

    /// Create a peer joined notification.
    pub fn peer_joined(board_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::PeerJoined,
            peer_id: info.peer_id,
            board_id,
            clock: 0,
            sequence: 0,
            payload: encode_value(info)?,
        })
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, board_id: Uuid) -> Self {
        Self::control(MessageType::PeerLeft, peer_id, board_id)
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::control(MessageType::Ping, peer_id, Uuid::nil())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::control(MessageType::Pong, peer_id, Uuid::nil())
    }

    fn control(msg_type: MessageType, peer_id: Uuid, board_id: Uuid) -> Self {
        Self {
            msg_type,
            peer_id,
            board_id,
            clock: 0,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_value(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_value(bytes)
    }

    /// Parse the delta carried by a `Delta` message.
    pub fn delta_payload(&self) -> Result<Delta, ProtocolError> {
        self.expect(MessageType::Delta)?;
        decode_value(&self.payload)
    }

    /// Parse the catch-up entries carried by a `SyncStep2` message.
    pub fn sync_entries(&self) -> Result<Vec<SequencedDelta>, ProtocolError> {
        self.expect(MessageType::SyncStep2)?;
        decode_value(&self.payload)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        decode_value(&self.payload)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType {
                expected: msg_type,
                found: self.msg_type,
            });
        }
        Ok(())
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_value<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: expected {expected:?}, got {found:?}")]
    InvalidMessageType {
        expected: MessageType,
        found: MessageType,
    },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Offline queue full")]
    QueueFull,
    #[error("Connection timeout")]
    Timeout,
}
