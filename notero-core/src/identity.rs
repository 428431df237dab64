//! Per-session user identity.
//!
//! The assigned user id lives in the session store so that a restarted
//! client keeps its identity. A remembered id is only reused when the users
//! map still holds a record for it; otherwise a fresh identity is minted.
//! Notes and ballots attributed to the forgotten id stay attributed to it.

use uuid::Uuid;

use crate::map::ReplicatedMap;
use crate::model::User;
use crate::session::SessionStore;

/// Session store key holding the assigned user id.
pub const USER_ID_KEY: &str = "userId";

const ADJECTIVES: [&str; 16] = [
    "Brave", "Calm", "Clever", "Curious", "Eager", "Gentle", "Happy", "Jolly",
    "Kind", "Lively", "Lucky", "Merry", "Nimble", "Quiet", "Swift", "Witty",
];

const ANIMALS: [&str; 16] = [
    "Badger", "Crane", "Dolphin", "Falcon", "Fox", "Heron", "Koala", "Lynx",
    "Marten", "Otter", "Owl", "Panda", "Raven", "Seal", "Tiger", "Wombat",
];

/// Display name derived from the id's random bits, e.g. "Nimble Otter".
pub fn display_name_for(id: Uuid) -> String {
    let bits = id.as_u128();
    let adjective = ADJECTIVES[(bits & 0x0F) as usize];
    let animal = ANIMALS[((bits >> 8) & 0x0F) as usize];
    format!("{adjective} {animal}")
}

/// Resolves and remembers the current user of one session.
pub struct IdentityManager<S> {
    store: S,
    current: Option<User>,
}

impl<S: SessionStore> IdentityManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            current: None,
        }
    }

    /// Return this session's user, creating and registering one if needed.
    ///
    /// Only the first call may touch the users map; later calls return the
    /// cached user.
    pub fn ensure_identity(&mut self, users: &ReplicatedMap<String, User>) -> User {
        if let Some(user) = &self.current {
            return user.clone();
        }

        let remembered = self
            .store
            .get(USER_ID_KEY)
            .and_then(|id| users.get(&id).map(|user| (id, user)));

        let user = match remembered {
            Some((id, user)) => {
                log::info!("Reusing session identity {} ({id})", user.name);
                user
            }
            None => {
                if let Some(stale) = self.store.get(USER_ID_KEY) {
                    log::info!("Session id {stale} has no user record; creating a new identity");
                }
                let id = Uuid::new_v4();
                let user = User::new(id.to_string(), display_name_for(id));
                self.store.set(USER_ID_KEY, user.id.clone());
                users.set(user.id.clone(), user.clone());
                log::info!("Created identity {} ({})", user.name, user.id);
                user
            }
        };

        self.current = Some(user.clone());
        user
    }

    /// The resolved user, if `ensure_identity` has run.
    pub fn current(&self) -> Option<&User> {
        self.current.as_ref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Broadcaster, Delta};
    use crate::session::MemorySessionStore;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counter {
        published: Mutex<usize>,
    }

    impl Broadcaster for Counter {
        fn publish(&self, _delta: Delta) {
            *self.published.lock().unwrap() += 1;
        }
    }

    fn users() -> (ReplicatedMap<String, User>, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        (ReplicatedMap::new("users", counter.clone()), counter)
    }

    #[test]
    fn test_first_call_creates_and_persists() {
        let (users, counter) = users();
        let mut identity = IdentityManager::new(MemorySessionStore::new());

        let user = identity.ensure_identity(&users);

        assert_eq!(users.len(), 1);
        assert_eq!(users.get(&user.id), Some(user.clone()));
        assert_eq!(identity.store().get(USER_ID_KEY), Some(user.id.clone()));
        assert_eq!(*counter.published.lock().unwrap(), 1);
    }

    #[test]
    fn test_repeated_calls_are_idempotent() {
        let (users, counter) = users();
        let mut identity = IdentityManager::new(MemorySessionStore::new());

        let first = identity.ensure_identity(&users);
        let second = identity.ensure_identity(&users);

        assert_eq!(first, second);
        assert_eq!(users.len(), 1);
        assert_eq!(*counter.published.lock().unwrap(), 1);
        assert_eq!(identity.current(), Some(&first));
    }

    #[test]
    fn test_reuses_remembered_identity() {
        let (users, _) = users();
        let existing = User::new("u-42", "Quiet Owl");
        users.set(existing.id.clone(), existing.clone());

        let mut store = MemorySessionStore::new();
        store.set(USER_ID_KEY, "u-42".into());
        let mut identity = IdentityManager::new(store);

        assert_eq!(identity.ensure_identity(&users), existing);
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn test_stale_id_gets_fresh_identity() {
        let (users, _) = users();
        let mut store = MemorySessionStore::new();
        store.set(USER_ID_KEY, "gone".into());
        let mut identity = IdentityManager::new(store);

        let user = identity.ensure_identity(&users);

        assert_ne!(user.id, "gone");
        assert_eq!(identity.store().get(USER_ID_KEY), Some(user.id.clone()));
        assert!(users.has(&user.id));
    }

    #[test]
    fn test_display_name_is_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(display_name_for(id), display_name_for(id));
        let name = display_name_for(id);
        let mut parts = name.split(' ');
        assert!(ADJECTIVES.contains(&parts.next().unwrap()));
        assert!(ANIMALS.contains(&parts.next().unwrap()));
    }
}
