//! Listener registry with explicit subscription handles.
//!
//! Every `subscribe` returns a [`Subscription`]; dropping or cancelling it
//! unregisters the listener. Listeners run outside the registry lock, so a
//! listener may subscribe, unsubscribe or read board state while handling
//! an event.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<E>>,
}

/// Fan-out of events of type `E` to registered listeners, in registration order.
pub struct EventHub<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> EventHub<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }

    /// Register a listener. It stays registered while the returned handle lives.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(id, Arc::new(listener));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .listeners
                    .remove(&id);
            }
        })
    }

    /// Deliver `event` to every listener registered at the time of the call.
    ///
    /// A listener cancelled by an earlier listener during this call is
    /// skipped. One registered during the call first hears the next event.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<(u64, Listener<E>)> = {
            let registry = self.lock();
            registry
                .listeners
                .iter()
                .map(|(id, listener)| (*id, listener.clone()))
                .collect()
        };
        for (id, listener) in snapshot {
            if self.lock().listeners.contains_key(&id) {
                listener(event);
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

/// Cancellation handle for a registered listener.
#[must_use = "dropping a Subscription unregisters its listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unregister now. Equivalent to dropping the handle.
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
