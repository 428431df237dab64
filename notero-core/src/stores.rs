//! The three replicated maps that make up one board replica.

use std::sync::Arc;

use crate::map::{Broadcaster, Delta, MapError, ReplicatedMap};
use crate::model::{Ballot, Note, User};

pub const NOTES_MAP: &str = "notes";
pub const BALLOTS_MAP: &str = "ballots";
pub const USERS_MAP: &str = "users";

/// Which of the three maps a change or delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Notes,
    Ballots,
    Users,
}

impl StoreKind {
    pub fn map_name(self) -> &'static str {
        match self {
            StoreKind::Notes => NOTES_MAP,
            StoreKind::Ballots => BALLOTS_MAP,
            StoreKind::Users => USERS_MAP,
        }
    }

    pub fn from_map_name(name: &str) -> Option<Self> {
        match name {
            NOTES_MAP => Some(StoreKind::Notes),
            BALLOTS_MAP => Some(StoreKind::Ballots),
            USERS_MAP => Some(StoreKind::Users),
            _ => None,
        }
    }
}

/// One participant's replica of the board: notes, ballots and users,
/// all publishing through the same broadcaster.
pub struct BoardStores {
    notes: ReplicatedMap<String, Note>,
    ballots: ReplicatedMap<String, Ballot>,
    users: ReplicatedMap<String, User>,
}

impl BoardStores {
    pub fn new(outbound: Arc<dyn Broadcaster>) -> Self {
        Self {
            notes: ReplicatedMap::new(NOTES_MAP, outbound.clone()),
            ballots: ReplicatedMap::new(BALLOTS_MAP, outbound.clone()),
            users: ReplicatedMap::new(USERS_MAP, outbound),
        }
    }

    pub fn notes(&self) -> &ReplicatedMap<String, Note> {
        &self.notes
    }

    pub fn ballots(&self) -> &ReplicatedMap<String, Ballot> {
        &self.ballots
    }

    pub fn users(&self) -> &ReplicatedMap<String, User> {
        &self.users
    }

    /// Route a delta from another replica to the map it names.
    pub fn apply_remote(&self, delta: &Delta) -> Result<(), MapError> {
        match StoreKind::from_map_name(&delta.map) {
            Some(StoreKind::Notes) => self.notes.apply_remote(delta),
            Some(StoreKind::Ballots) => self.ballots.apply_remote(delta),
            Some(StoreKind::Users) => self.users.apply_remote(delta),
            None => Err(MapError::UnknownMap(delta.map.clone())),
        }
    }

    /// Route the echo of one of our own deltas to the map it names.
    pub fn acknowledge(&self, delta: &Delta) -> Result<(), MapError> {
        match StoreKind::from_map_name(&delta.map) {
            Some(StoreKind::Notes) => self.notes.acknowledge(delta),
            Some(StoreKind::Ballots) => self.ballots.acknowledge(delta),
            Some(StoreKind::Users) => self.users.acknowledge(delta),
            None => Err(MapError::UnknownMap(delta.map.clone())),
        }
    }

    /// Route a delta the transport could not take back to the map it names.
    pub fn abandon(&self, delta: &Delta) -> Result<(), MapError> {
        match StoreKind::from_map_name(&delta.map) {
            Some(StoreKind::Notes) => self.notes.abandon(delta),
            Some(StoreKind::Ballots) => self.ballots.abandon(delta),
            Some(StoreKind::Users) => self.users.abandon(delta),
            None => Err(MapError::UnknownMap(delta.map.clone())),
        }
    }

    /// Local writes across all three maps still awaiting acknowledgement.
    pub fn pending_len(&self) -> usize {
        self.notes.pending_len() + self.ballots.pending_len() + self.users.pending_len()
    }
}
