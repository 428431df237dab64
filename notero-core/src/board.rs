//! Board commands and queries for one participant.

use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::aggregate;
use crate::identity::IdentityManager;
use crate::map::ChangeKind;
use crate::model::{AggregatedNote, Ballot, Note, User};
use crate::session::SessionStore;
use crate::stores::BoardStores;

/// Orchestrates the notes, ballots and users maps on behalf of the current user.
///
/// The engine only exists once an identity has been resolved, so every
/// command is attributed to a known user.
pub struct BoardEngine {
    stores: Arc<BoardStores>,
    user: User,
}

impl BoardEngine {
    /// Resolve the session identity against `stores` and start an engine for it.
    pub fn join<S: SessionStore>(stores: Arc<BoardStores>, identity: &mut IdentityManager<S>) -> Self {
        let user = identity.ensure_identity(stores.users());
        Self { stores, user }
    }

    /// Post a note. Blank text is ignored.
    pub fn create_note(&self, text: &str) {
        if text.trim().is_empty() {
            log::debug!("Ignoring blank note from {}", self.user.id);
            return;
        }

        let note = Note {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            author: self.user.clone(),
        };
        log::debug!("{} created note {}", self.user.name, note.id);
        self.stores.notes().set(note.id.clone(), note);
    }

    /// Vote for `note` if the current user has not, otherwise withdraw the vote.
    pub fn toggle_vote(&self, note: &Note) {
        let ballot = Ballot::cast(note, &self.user);
        let id = ballot.id.clone();
        match self.stores.ballots().toggle(id, || ballot) {
            ChangeKind::Set => log::debug!("{} voted for {}", self.user.name, note.id),
            ChangeKind::Delete => log::debug!("{} withdrew from {}", self.user.name, note.id),
        }
    }

    /// Every note with its vote count, computed from the current replica state.
    pub fn aggregated_board(&self) -> Vec<AggregatedNote> {
        let notes = self.stores.notes().values();
        let ballots = self.stores.ballots().values();
        aggregate(&notes, &ballots, &self.user.id)
    }

    /// All users who have ever joined, in unspecified order.
    pub fn list_users(&self) -> Vec<User> {
        self.stores.users().values()
    }

    pub fn current_user(&self) -> &User {
        &self.user
    }

    pub fn stores(&self) -> &Arc<BoardStores> {
        &self.stores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackRelay;
    use crate::session::MemorySessionStore;

    fn solo() -> (LoopbackRelay, BoardEngine) {
        let relay = LoopbackRelay::new();
        let (_, stores) = relay.spawn_replica();
        let mut identity = IdentityManager::new(MemorySessionStore::new());
        let engine = BoardEngine::join(stores, &mut identity);
        (relay, engine)
    }

    #[test]
    fn test_create_note_attributes_author() {
        let (_relay, engine) = solo();
        engine.create_note("hello");

        let board = engine.aggregated_board();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].note.text, "hello");
        assert_eq!(&board[0].note.author, engine.current_user());
        assert_eq!(board[0].vote_count, 0);
    }

    #[test]
    fn test_blank_notes_ignored() {
        let (_relay, engine) = solo();
        engine.create_note("");
        engine.create_note("   ");
        engine.create_note("\t\n");
        assert!(engine.aggregated_board().is_empty());
    }

    #[test]
    fn test_note_ids_unique() {
        let (_relay, engine) = solo();
        engine.create_note("same");
        engine.create_note("same");
        let board = engine.aggregated_board();
        assert_eq!(board.len(), 2);
        assert_ne!(board[0].note.id, board[1].note.id);
    }

    #[test]
    fn test_toggle_vote_alternates() {
        let (_relay, engine) = solo();
        engine.create_note("vote me");
        let note = engine.aggregated_board()[0].note.clone();

        for round in 1..=6 {
            engine.toggle_vote(&note);
            let entry = &engine.aggregated_board()[0];
            let voted = round % 2 == 1;
            assert_eq!(entry.voted_by_current_user, voted);
            assert_eq!(entry.vote_count, usize::from(voted));
        }
        assert!(engine.stores().ballots().is_empty());
    }

    #[test]
    fn test_each_toggle_publishes_one_ballot_write() {
        let relay = LoopbackRelay::new();
        let (id, stores) = relay.spawn_replica();
        let engine = BoardEngine::join(stores, &mut IdentityManager::new(MemorySessionStore::new()));
        engine.create_note("vote me");
        let note = engine.aggregated_board()[0].note.clone();
        relay.deliver_all();

        for round in 1..=4 {
            engine.toggle_vote(&note);
            assert_eq!(relay.outbox_len(id), round);
        }
    }

    #[test]
    fn test_list_users_contains_current() {
        let (_relay, engine) = solo();
        let users = engine.list_users();
        assert_eq!(users, vec![engine.current_user().clone()]);
    }
}
