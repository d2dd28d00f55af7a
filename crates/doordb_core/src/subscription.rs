//! Callback registries with drop-to-unregister handles.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Handle for a registered callback. Dropping it unregisters the callback.
#[must_use = "dropping a Subscription unregisters it immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Keeps the callback registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// A list of entries that can be added to and removed by handle.
pub(crate) struct Registry<T> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, T)>>,
}

impl<T: Clone + Send + Sync + 'static> Registry<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        })
    }

    pub(crate) fn add(self: &Arc<Self>, entry: T) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, entry));
        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.entries.write().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Snapshot of the entries, so callbacks run without the lock held.
    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries.read().iter().map(|(_, e)| e.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}
