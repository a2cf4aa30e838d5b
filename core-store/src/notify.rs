//! Change listeners.
//!
//! Listeners are plain callbacks registered against a [`Scope`]. After a
//! transaction commits, each listener receives the changes whose new or
//! previous version falls inside its scope. Callbacks run on the committing
//! task and must not block.

use crate::record::{Change, ChangeSet};
use crate::scope::Scope;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

pub type ChangeListener = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

struct Registration {
    scope: Scope,
    listener: ChangeListener,
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<u64, Registration>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, scope: Scope, listener: ChangeListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(id, entity_type = %scope.entity_type, "Registering change listener");
        self.listeners
            .write()
            .insert(id, Registration { scope, listener });

        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fans committed changes out to every listener whose scope they touch.
    pub fn notify(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }

        // Snapshot first so callbacks may subscribe or unsubscribe.
        let targets: Vec<(Scope, ChangeListener)> = self
            .listeners
            .read()
            .values()
            .map(|r| (r.scope.clone(), r.listener.clone()))
            .collect();

        for (scope, listener) in targets {
            let relevant: Vec<Change> = changes
                .iter()
                .filter(|change| {
                    change.current().map(|r| scope.matches(r)).unwrap_or(false)
                        || change.previous().map(|r| scope.matches(r)).unwrap_or(false)
                })
                .cloned()
                .collect();

            if !relevant.is_empty() {
                listener(&ChangeSet { changes: relevant });
            }
        }
    }

    fn remove(&self, id: u64) {
        self.listeners.write().remove(&id);
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Keeps a listener registered; dropping it unregisters.
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn cancel(self) {}

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.listeners.read().contains_key(&self.id))
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
