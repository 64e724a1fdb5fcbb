//! Error handling and edge case tests.

use async_trait::async_trait;
use eventhub::storage::StorageResult;
use eventhub::{
    initialize_with_retry, BootOutcome, ErrorReceiver, Event, EventRecord, EventSink, Hub,
    HubConfig, HubDirectory, HubError, HubMode, InMemoryStorage, RecordFilter, SinkClosed,
    StorageError, StorageKind, StorageProvider,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
}

impl Event for OrderCreated {
    fn event_type() -> &'static str {
        "OrderCreated"
    }
}

/// In-memory storage whose operations fail a configurable number of times.
///
/// With `persistent` set it reports itself as durable, so the delivery loop
/// marks records complete.
#[derive(Default)]
struct FlakyStorage {
    inner: InMemoryStorage,
    persistent: bool,
    store_failures: AtomicU32,
    batch_failures: AtomicU32,
    complete_failures: AtomicU32,
    restore_failures: AtomicU32,
    store_calls: AtomicU32,
    batch_calls: AtomicU32,
    complete_calls: AtomicU32,
    restore_calls: AtomicU32,
}

impl FlakyStorage {
    fn failing_store(times: u32) -> Self {
        let storage = Self::default();
        storage.store_failures.store(times, Ordering::SeqCst);
        storage
    }

    fn failing_restore(times: u32) -> Self {
        let storage = Self::default();
        storage.restore_failures.store(times, Ordering::SeqCst);
        storage
    }

    fn failing_batch(times: u32) -> Self {
        let storage = Self::default();
        storage.batch_failures.store(times, Ordering::SeqCst);
        storage
    }

    fn failing_complete(times: u32) -> Self {
        let storage = Self {
            persistent: true,
            ..Self::default()
        };
        storage.complete_failures.store(times, Ordering::SeqCst);
        storage
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StorageProvider for FlakyStorage {
    fn kind(&self) -> StorageKind {
        if self.persistent {
            StorageKind::Persistent
        } else {
            StorageKind::InMemory
        }
    }

    async fn store_event(&self, record: EventRecord) -> StorageResult<()> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.store_failures) {
            return Err(StorageError::Unavailable("store offline".to_string()));
        }
        self.inner.store_event(record).await
    }

    async fn get_next_batch(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> StorageResult<Vec<EventRecord>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.batch_failures) {
            return Err(StorageError::Unavailable("store offline".to_string()));
        }
        self.inner.get_next_batch(filter, limit).await
    }

    async fn mark_event_as_complete(&self, record: &EventRecord) -> StorageResult<()> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.complete_failures) {
            return Err(StorageError::Unavailable("store offline".to_string()));
        }
        self.inner.mark_event_as_complete(record).await
    }

    async fn restore_subscriber_ids(&self, event_type: &str) -> StorageResult<Vec<String>> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.restore_failures) {
            return Err(StorageError::Unavailable("store offline".to_string()));
        }
        self.inner.restore_subscriber_ids(event_type).await
    }
}

#[derive(Default)]
struct CountingReceiver {
    store_errors: AtomicU32,
    batch_errors: AtomicU32,
    complete_errors: AtomicU32,
    overflows: AtomicU32,
}

impl ErrorReceiver for CountingReceiver {
    fn on_store_error(&self, _record: &EventRecord, _attempt: u32, _error: &StorageError) {
        self.store_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_get_next_batch_error(
        &self,
        _event_type: &str,
        _subscriber_id: &str,
        _attempt: u32,
        _error: &StorageError,
    ) {
        self.batch_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_mark_complete_error(&self, _record: &EventRecord, _attempt: u32, _error: &StorageError) {
        self.complete_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_queue_overflow(&self, _record: &EventRecord, _error: &StorageError) {
        self.overflows.fetch_add(1, Ordering::SeqCst);
    }
}

/// Takes every record.
#[derive(Default)]
struct CollectingSink {
    received: Vec<EventRecord>,
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn send(&mut self, record: &EventRecord) -> Result<(), SinkClosed> {
        self.received.push(record.clone());
        Ok(())
    }
}

/// A stream that is already gone.
struct ClosedSink;

#[async_trait]
impl EventSink for ClosedSink {
    async fn send(&mut self, _record: &EventRecord) -> Result<(), SinkClosed> {
        Err(SinkClosed)
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// --- Routing ---

#[tokio::test]
async fn test_route_unregistered_event_type() {
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new());

    let err = directory
        .route(&OrderCreated { id: 1 }, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::UnregisteredEventType(ref t) if t == "OrderCreated"));
}

// --- Transient storage errors ---

#[tokio::test(start_paused = true)]
async fn test_store_failures_are_retried_and_reported() {
    let storage = Arc::new(FlakyStorage::failing_store(2));
    let receiver = Arc::new(CountingReceiver::default());
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new())
        .with_error_receiver(receiver.clone());
    let hub: Hub<OrderCreated> = directory.create_hub(storage.clone());
    hub.core().registry().get_or_insert("A");

    let started = tokio::time::Instant::now();
    let report = hub
        .broadcast(&OrderCreated { id: 1 }, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.stored, 1);
    assert_eq!(storage.store_calls.load(Ordering::SeqCst), 3);
    assert_eq!(receiver.store_errors.load(Ordering::SeqCst), 2);
    assert_eq!(hub.stats().transient_errors, 2);
    // Two fixed backoffs of 5 s.
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_store_retries() {
    let storage = Arc::new(FlakyStorage::failing_store(u32::MAX));
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new());
    let hub: Hub<OrderCreated> = directory.create_hub(storage.clone());
    hub.core().registry().get_or_insert("A");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            cancel.cancel();
        });
    }

    let report = hub.broadcast(&OrderCreated { id: 1 }, cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.stored, 0);
    assert_eq!(storage.store_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_overflow_reported_to_receiver() {
    let receiver = Arc::new(CountingReceiver::default());
    let directory = HubDirectory::new(
        HubConfig::default().candidate_wait_limit(Duration::from_millis(20)),
        CancellationToken::new(),
    )
    .with_error_receiver(receiver.clone());
    let hub: Hub<OrderCreated> = directory.create_hub(Arc::new(InMemoryStorage::with_capacity(1)));
    hub.core().registry().get_or_insert("A");

    hub.broadcast(&OrderCreated { id: 1 }, CancellationToken::new())
        .await
        .unwrap();
    let report = hub
        .broadcast(&OrderCreated { id: 2 }, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.evicted, vec!["A".to_string()]);
    assert_eq!(receiver.overflows.load(Ordering::SeqCst), 1);
    assert_eq!(receiver.store_errors.load(Ordering::SeqCst), 0);
}

// --- Delivery loop errors ---

#[tokio::test(start_paused = true)]
async fn test_fetch_failures_are_retried_and_reported() {
    let storage = Arc::new(FlakyStorage::failing_batch(2));
    let receiver = Arc::new(CountingReceiver::default());
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new())
        .with_error_receiver(receiver.clone());
    let hub: Hub<OrderCreated> = directory.create_hub(storage.clone());
    hub.core().registry().get_or_insert("A");
    hub.broadcast(&OrderCreated { id: 1 }, CancellationToken::new())
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let mut sub = hub.subscribe("A");
    let event = sub.recv().await.unwrap().unwrap();

    assert_eq!(event, OrderCreated { id: 1 });
    assert!(storage.batch_calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(receiver.batch_errors.load(Ordering::SeqCst), 2);
    assert_eq!(hub.stats().transient_errors, 2);
    // Two fixed backoffs of 5 s.
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_mark_complete_failures_are_retried_and_reported() {
    let storage = Arc::new(FlakyStorage::failing_complete(2));
    let receiver = Arc::new(CountingReceiver::default());
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new())
        .with_error_receiver(receiver.clone());
    let hub: Hub<OrderCreated> = directory.create_hub(storage.clone());
    hub.core().registry().get_or_insert("A");
    for id in 1..=2 {
        hub.broadcast(&OrderCreated { id }, CancellationToken::new())
            .await
            .unwrap();
    }

    let started = tokio::time::Instant::now();
    let mut sub = hub.subscribe("A");
    assert_eq!(sub.recv().await.unwrap().unwrap().id, 1);

    // The second record waits until the first is settled.
    assert_eq!(sub.recv().await.unwrap().unwrap().id, 2);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(receiver.complete_errors.load(Ordering::SeqCst), 2);
    assert!(storage.complete_calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(hub.stats().transient_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_abandons_mark_complete_retries() {
    let storage = Arc::new(FlakyStorage::failing_complete(u32::MAX));
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new());
    let hub: Hub<OrderCreated> = directory.create_hub(storage.clone());
    hub.core().registry().get_or_insert("A");
    hub.broadcast(&OrderCreated { id: 1 }, CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            cancel.cancel();
        });
    }

    let core = Arc::clone(hub.core());
    let runner = tokio::spawn(async move {
        let mut sink = CollectingSink::default();
        core.run_subscriber("A", &mut sink, cancel).await;
        sink
    });
    let sink = tokio::time::timeout(Duration::from_secs(60), runner)
        .await
        .expect("delivery loop kept retrying after cancel")
        .unwrap();

    assert_eq!(sink.received.len(), 1);
    // Attempts at 0, 5 and 10 seconds.
    assert_eq!(storage.complete_calls.load(Ordering::SeqCst), 3);
    assert!(!hub.core().registry().get("A").unwrap().is_connected());
}

#[tokio::test]
async fn test_idle_loop_exits_when_subscriber_evicted() {
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new());
    let hub: Hub<OrderCreated> = directory.create_hub(Arc::new(InMemoryStorage::new()));

    let mut sub = hub.subscribe("A");
    wait_until(|| hub.stats().connected == 1).await;

    let evicted = hub.core().registry().evict("A").unwrap();

    // Well inside the 60 s idle ceiling.
    let ended = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("idle loop did not notice eviction");
    assert!(ended.is_none());
    assert!(!evicted.is_connected());
    assert_eq!(hub.stats().subscribers, 0);
}

#[tokio::test]
async fn test_round_robin_write_failure_disconnects_subscriber() {
    let config = HubConfig::with_mode(HubMode::ROUND_ROBIN)
        .retry_backoff(Duration::from_millis(10))
        .candidate_wait_limit(Duration::from_millis(50));
    let storage = Arc::new(InMemoryStorage::new());
    let directory = HubDirectory::new(config, CancellationToken::new());
    let hub: Hub<OrderCreated> = directory.create_hub(storage.clone());

    let core = Arc::clone(hub.core());
    let runner = tokio::spawn(async move {
        core.run_subscriber("A", &mut ClosedSink, CancellationToken::new())
            .await;
    });
    wait_until(|| hub.core().registry().connected_ids() == vec!["A".to_string()]).await;

    let report = hub
        .broadcast(&OrderCreated { id: 1 }, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.candidates, vec!["A".to_string()]);

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("delivery loop did not end on write failure")
        .unwrap();

    assert!(hub.core().registry().connected_ids().is_empty());
    assert_eq!(storage.queue_len("OrderCreated", "A"), 1);

    // No connected subscriber is left to rotate to.
    let report = hub
        .broadcast(&OrderCreated { id: 2 }, CancellationToken::new())
        .await
        .unwrap();
    assert!(report.candidates.is_empty());
}

// --- Boot ---

#[tokio::test(start_paused = true)]
async fn test_boot_times_out_after_persistent_failure() {
    let storage = Arc::new(FlakyStorage::failing_restore(u32::MAX));
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new());
    let _hub: Hub<OrderCreated> = directory.create_hub(storage.clone());

    let err = initialize_with_retry(&directory, CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        HubError::BootTimeout { elapsed, last_error } => {
            assert!(elapsed >= Duration::from_secs(30));
            assert!(matches!(
                *last_error,
                HubError::Initialization { ref event_type, .. } if event_type == "OrderCreated"
            ));
        }
        other => panic!("expected BootTimeout, got {other:?}"),
    }
    // Attempts at 0, 5, 10, 15, 20, 25 and 30 seconds.
    assert_eq!(storage.restore_calls.load(Ordering::SeqCst), 7);
}

#[tokio::test(start_paused = true)]
async fn test_boot_recovers_after_transient_failures() {
    let storage = Arc::new(FlakyStorage::failing_restore(2));
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new());
    let _hub: Hub<OrderCreated> = directory.create_hub(storage.clone());

    let outcome = initialize_with_retry(&directory, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, BootOutcome::Ready);
    assert_eq!(storage.restore_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_boot_cancelled_while_retrying() {
    let storage = Arc::new(FlakyStorage::failing_restore(u32::MAX));
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new());
    let _hub: Hub<OrderCreated> = directory.create_hub(storage.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            cancel.cancel();
        });
    }

    let outcome = initialize_with_retry(&directory, cancel).await.unwrap();
    assert_eq!(outcome, BootOutcome::Cancelled);
    assert_eq!(storage.restore_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_boot_with_no_hubs_is_ready() {
    let directory = HubDirectory::new(HubConfig::default(), CancellationToken::new());
    let outcome = initialize_with_retry(&directory, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, BootOutcome::Ready);
}
