//! Board records stored in the replicated maps.
//!
//! `User`, `Note` and `Ballot` are written once and never edited in place;
//! a ballot is either present (voted) or absent (not voted).
//! `AggregatedNote` is derived on demand and never stored.

use serde::{Deserialize, Serialize};

/// A participant on the board. Identity is self-asserted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A text note posted to the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Globally unique (UUID v4).
    pub id: String,
    pub text: String,
    pub author: User,
}

/// "This user currently supports this note."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    /// Always `note_id ⧺ user.id`, see [`Ballot::id_for`].
    pub id: String,
    pub note_id: String,
    pub user: User,
}

impl Ballot {
    /// Build the ballot a user casts for a note.
    pub fn cast(note: &Note, user: &User) -> Self {
        Self {
            id: Self::id_for(&note.id, &user.id),
            note_id: note.id.clone(),
            user: user.clone(),
        }
    }

    /// Deterministic ballot key: one (user, note) pair maps to one key.
    pub fn id_for(note_id: &str, user_id: &str) -> String {
        let mut id = String::with_capacity(note_id.len() + user_id.len());
        id.push_str(note_id);
        id.push_str(user_id);
        id
    }
}

/// A note annotated with its votes, as seen by one viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedNote {
    pub note: Note,
    pub vote_count: usize,
    pub voted_by_current_user: bool,
}
