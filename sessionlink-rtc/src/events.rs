//! Keyed publish/subscribe with explicit unsubscription.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`EventBus::on`], passed back to [`EventBus::off`]
pub type SubscriptionId = u64;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Fan-out of events to handlers registered per key.
///
/// Handlers run synchronously on the emitting task, outside the internal
/// lock, so a handler may subscribe or unsubscribe. Long-running work belongs
/// on a channel the handler feeds.
pub struct EventBus<K, E> {
    handlers: RwLock<HashMap<K, Vec<(SubscriptionId, Handler<E>)>>>,
    next_id: AtomicU64,
}

impl<K, E> EventBus<K, E>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn on<F>(&self, key: K, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(key)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        handlers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sub_id, _)| *sub_id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Deliver `event` to every handler for `key`; returns the handler count
    pub fn emit(&self, key: &K, event: &E) -> usize {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .read()
            .get(key)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    #[must_use]
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.handlers.read().get(key).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

impl<K, E> Default for EventBus<K, E>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
