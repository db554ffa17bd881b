// src/utils/observer.rs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::utils::lock;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
}

/// Explicit observer list used for push-based fan-out
/// (connection status, channel state, inbound messages, sync progress).
///
/// Listeners run synchronously on the notifying task, outside the lock,
/// so a listener may subscribe or unsubscribe without deadlocking.
pub struct ObserverList<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(id, Arc::new(listener));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            active: AtomicBool::new(true),
            detach: Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).listeners.remove(&id);
                }
            }),
        }
    }

    pub fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = lock(&self.registry).listeners.values().cloned().collect();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.registry).listeners.clear();
    }
}

impl<T: 'static> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`ObserverList::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    active: AtomicBool,
    detach: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    /// Removes the listener. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            (self.detach)();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
