//! Single "board changed" signal over the three replicated maps.
//!
//! Each underlying map change produces exactly one notification. There is
//! no batching: a notification means "re-read the board", not a diff.

use crate::event::{EventHub, Subscription};
use crate::map::ChangeOrigin;
use crate::stores::{BoardStores, StoreKind};

/// Emitted once per mutation of any board map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardChanged {
    pub store: StoreKind,
    pub origin: ChangeOrigin,
}

pub struct ChangeNotifier {
    hub: EventHub<BoardChanged>,
    // Held so the forwarding listeners stay registered with the maps.
    _sources: [Subscription; 3],
}

impl ChangeNotifier {
    pub fn new(stores: &BoardStores) -> Self {
        let hub = EventHub::new();

        let notes = hub.clone();
        let notes_sub = stores.notes().subscribe(move |change| {
            notes.emit(&BoardChanged {
                store: StoreKind::Notes,
                origin: change.origin,
            })
        });

        let ballots = hub.clone();
        let ballots_sub = stores.ballots().subscribe(move |change| {
            ballots.emit(&BoardChanged {
                store: StoreKind::Ballots,
                origin: change.origin,
            })
        });

        let users = hub.clone();
        let users_sub = stores.users().subscribe(move |change| {
            users.emit(&BoardChanged {
                store: StoreKind::Users,
                origin: change.origin,
            })
        });

        Self {
            hub,
            _sources: [notes_sub, ballots_sub, users_sub],
        }
    }

    /// Register a listener for board changes. Drop the handle to stop listening.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&BoardChanged) + Send + Sync + 'static,
    {
        self.hub.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }
}
