//! Bounded in-memory event queues.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use super::{StorageKind, StorageProvider, StorageResult};
use crate::error::StorageError;
use crate::types::{EventRecord, RecordFilter, Timestamp};

/// Queue key: (event type, subscriber id).
type QueueKey = (String, String);

/// Volatile provider with one bounded FIFO queue per subscriber.
///
/// Reading a batch removes the records from the queue, so there is nothing to
/// mark complete afterwards. Nothing survives a restart.
pub struct InMemoryStorage {
    queues: Mutex<HashMap<QueueKey, VecDeque<EventRecord>>>,
    capacity: usize,
}

impl InMemoryStorage {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a provider whose queues hold at most `capacity` records each.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of records queued for a subscriber (including expired ones not yet dropped).
    pub fn queue_len(&self, event_type: &str, subscriber_id: &str) -> usize {
        self.queues
            .lock()
            .get(&(event_type.to_string(), subscriber_id.to_string()))
            .map_or(0, VecDeque::len)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::InMemory
    }

    async fn store_event(&self, record: EventRecord) -> StorageResult<()> {
        let mut queues = self.queues.lock();
        let queue = queues
            .entry((record.event_type.clone(), record.subscriber_id.clone()))
            .or_default();

        if queue.len() >= self.capacity {
            return Err(StorageError::CapacityExceeded {
                subscriber_id: record.subscriber_id,
                capacity: self.capacity,
            });
        }

        queue.push_back(record);
        Ok(())
    }

    async fn get_next_batch(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> StorageResult<Vec<EventRecord>> {
        let mut queues = self.queues.lock();
        let key = (filter.event_type.clone(), filter.subscriber_id.clone());
        let Some(queue) = queues.get_mut(&key) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::with_capacity(limit.min(queue.len()));
        while batch.len() < limit {
            match queue.pop_front() {
                Some(record) if filter.matches(&record) => batch.push(record),
                // Expired or already complete: never deliverable again.
                Some(_) => continue,
                None => break,
            }
        }

        if queue.is_empty() {
            queues.remove(&key);
        }

        Ok(batch)
    }

    async fn mark_event_as_complete(&self, _record: &EventRecord) -> StorageResult<()> {
        Ok(())
    }

    async fn restore_subscriber_ids(&self, event_type: &str) -> StorageResult<Vec<String>> {
        let now = Timestamp::now();
        let queues = self.queues.lock();
        let mut ids: Vec<String> = queues
            .iter()
            .filter(|((ty, _), queue)| ty == event_type && queue.iter().any(|r| r.is_pending(now)))
            .map(|((_, subscriber), _)| subscriber.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn purge_stale(&self) -> StorageResult<usize> {
        let now = Timestamp::now();
        let mut queues = self.queues.lock();
        let mut removed = 0;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|r| r.is_pending(now));
            removed += before - queue.len();
        }
        queues.retain(|_, queue| !queue.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(subscriber: &str, n: u32) -> EventRecord {
        EventRecord::new(
            subscriber,
            "orders",
            n.to_le_bytes().to_vec(),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_batch_limit_leaves_remainder() {
        let storage = InMemoryStorage::new();
        for n in 0..30 {
            storage.store_event(record("a", n)).await.unwrap();
        }

        let filter = RecordFilter::new("orders", "a");
        let first = storage.get_next_batch(&filter, 25).await.unwrap();
        assert_eq!(first.len(), 25);
        assert_eq!(first[0].payload, 0u32.to_le_bytes().to_vec());

        let second = storage.get_next_batch(&filter, 25).await.unwrap();
        assert_eq!(second.len(), 5);
        assert_eq!(second[4].payload, 29u32.to_le_bytes().to_vec());

        assert!(storage.get_next_batch(&filter, 25).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let storage = InMemoryStorage::with_capacity(2);
        storage.store_event(record("a", 1)).await.unwrap();
        storage.store_event(record("a", 2)).await.unwrap();

        let err = storage.store_event(record("a", 3)).await.unwrap_err();
        assert!(err.is_capacity_exceeded());

        // Other subscribers have their own queue.
        storage.store_event(record("b", 1)).await.unwrap();
        assert_eq!(storage.queue_len("orders", "a"), 2);
    }

    #[tokio::test]
    async fn test_expired_records_are_skipped() {
        let storage = InMemoryStorage::new();
        let mut stale = record("a", 1);
        stale.expire_on = Timestamp::now().before(Duration::from_secs(1));
        storage.store_event(stale).await.unwrap();
        storage.store_event(record("a", 2)).await.unwrap();

        let batch = storage
            .get_next_batch(&RecordFilter::new("orders", "a"), 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, 2u32.to_le_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_restore_and_purge() {
        let storage = InMemoryStorage::new();
        storage.store_event(record("b", 1)).await.unwrap();
        storage.store_event(record("a", 1)).await.unwrap();
        let mut stale = record("c", 1);
        stale.expire_on = Timestamp::now().before(Duration::from_secs(1));
        storage.store_event(stale).await.unwrap();

        let ids = storage.restore_subscriber_ids("orders").await.unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(storage.restore_subscriber_ids("payments").await.unwrap().is_empty());

        assert_eq!(storage.purge_stale().await.unwrap(), 1);
        assert_eq!(storage.queue_len("orders", "c"), 0);
        assert_eq!(storage.queue_len("orders", "a"), 1);
    }
}
