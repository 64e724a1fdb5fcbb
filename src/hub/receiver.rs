//! Hooks for observing storage failures inside the hub.

use crate::error::StorageError;
use crate::types::EventRecord;

/// Receives the storage errors the hub retries or absorbs.
///
/// The hub logs every one of these itself; implement this to count them,
/// alert on them or forward them elsewhere. All methods default to no-ops and
/// are called inline, so implementations must not block.
pub trait ErrorReceiver: Send + Sync + 'static {
    /// Storing a record for a subscriber failed and will be retried.
    fn on_store_error(&self, _record: &EventRecord, _attempt: u32, _error: &StorageError) {}

    /// Fetching a subscriber's next batch failed and will be retried.
    fn on_get_next_batch_error(
        &self,
        _event_type: &str,
        _subscriber_id: &str,
        _attempt: u32,
        _error: &StorageError,
    ) {
    }

    /// Marking a delivered record complete failed and will be retried.
    fn on_mark_complete_error(&self, _record: &EventRecord, _attempt: u32, _error: &StorageError) {}

    /// A subscriber's queue was full; the subscriber was evicted and `record` dropped.
    fn on_queue_overflow(&self, _record: &EventRecord, _error: &StorageError) {}
}
