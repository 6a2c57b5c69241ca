//! Observer registry for feed updates.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::feed::FeedUpdate;

type Callback = Arc<dyn Fn(&FeedUpdate) + Send + Sync>;

/// Handle returned by [`Listeners::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A cloneable set of callbacks invoked for every [`FeedUpdate`].
///
/// Callbacks run on the notifying task with no feed lock held, so they may
/// read from the feed or register further listeners.
#[derive(Clone, Default)]
pub struct Listeners {
    callbacks: Arc<RwLock<Vec<(ListenerId, Callback)>>>,
    next_id: Arc<AtomicU64>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&FeedUpdate) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    /// Returns `true` if the listener was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn notify(&self, update: &FeedUpdate) {
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(update);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}
