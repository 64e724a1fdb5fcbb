//! Subscriber registry for one event type.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::subscriber::Subscriber;

/// Concurrent map of subscriber id to [`Subscriber`], ordered by id.
///
/// Lock hold times are tiny and never span an await; callers get `Arc`
/// handles or owned snapshots.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<BTreeMap<String, Arc<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the subscriber for `id`, creating it on first sight.
    pub fn get_or_insert(&self, id: &str) -> Arc<Subscriber> {
        if let Some(subscriber) = self.subscribers.read().get(id) {
            return Arc::clone(subscriber);
        }

        let mut subscribers = self.subscribers.write();
        Arc::clone(
            subscribers
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Subscriber::new(id))),
        )
    }

    /// Register ids restored from storage. Returns how many were new.
    pub fn restore<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut subscribers = self.subscribers.write();
        let mut added = 0;
        for id in ids {
            subscribers.entry(id).or_insert_with_key(|id| {
                added += 1;
                Arc::new(Subscriber::new(id.as_str()))
            });
        }
        added
    }

    pub fn get(&self, id: &str) -> Option<Arc<Subscriber>> {
        self.subscribers.read().get(id).cloned()
    }

    /// Whether `subscriber` is still the registered entry for its id.
    ///
    /// False once it was evicted, even if a new subscriber with the same id
    /// has since connected.
    pub fn is_current(&self, subscriber: &Arc<Subscriber>) -> bool {
        self.subscribers
            .read()
            .get(subscriber.id())
            .is_some_and(|current| Arc::ptr_eq(current, subscriber))
    }

    /// Remove a subscriber and close its wake signal.
    pub fn evict(&self, id: &str) -> Option<Arc<Subscriber>> {
        let removed = self.subscribers.write().remove(id);
        if let Some(ref subscriber) = removed {
            subscriber.close();
        }
        removed
    }

    /// Snapshot of all known ids, in order.
    pub fn ids(&self) -> Vec<String> {
        self.subscribers.read().keys().cloned().collect()
    }

    /// Snapshot of ids with an open stream, in order.
    pub fn connected_ids(&self) -> Vec<String> {
        self.subscribers
            .read()
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}
