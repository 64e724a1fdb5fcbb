//! Storage providers for per-subscriber event queues.
//!
//! Every hub writes one [`EventRecord`] per target subscriber and each
//! subscriber loop drains its own queue. Two providers implement the same
//! [`StorageProvider`] contract:
//!
//! - [`InMemoryStorage`]: bounded per-subscriber queues, records removed on
//!   read, lost on restart.
//! - [`PersistentStorage`]: append-only log on disk, records marked complete
//!   after delivery, replayed on restart.
//!
//! [`Storage`] is the configuration-selected choice between the two. The hub
//! only looks at [`StorageProvider::kind`] to decide whether a delivered
//! record needs marking complete and whether a failed write must be re-queued.
//!
//! # Example
//!
//! ```ignore
//! let storage = Storage::open(&StorageConfig::Persistent {
//!     path: "./events".into(),
//!     purge_interval: Some(Duration::from_secs(3600)),
//! })?;
//! let hub = directory.create_hub::<OrderCreated>(Arc::new(storage));
//! ```

mod memory;
mod persistent;

pub use memory::InMemoryStorage;
pub use persistent::PersistentStorage;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::types::{EventRecord, RecordFilter};

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Which delivery bookkeeping a provider needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// Records vanish when read; a failed delivery must be stored again.
    InMemory,
    /// Records stay until marked complete.
    Persistent,
}

/// Durable or volatile queue of event records keyed by subscriber and event type.
///
/// Implementations must be safe for concurrent use by many subscriber loops
/// and publishers at once.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    /// Delivery bookkeeping this provider needs.
    fn kind(&self) -> StorageKind;

    /// Persist one record for one subscriber.
    ///
    /// Bounded providers fail with [`StorageError::CapacityExceeded`] when the
    /// subscriber's queue is full.
    async fn store_event(&self, record: EventRecord) -> StorageResult<()>;

    /// Up to `limit` records matching `filter`, oldest first.
    async fn get_next_batch(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> StorageResult<Vec<EventRecord>>;

    /// Record that `record` was delivered. Idempotent.
    async fn mark_event_as_complete(&self, record: &EventRecord) -> StorageResult<()>;

    /// Subscribers that still have pending records for `event_type`.
    async fn restore_subscriber_ids(&self, event_type: &str) -> StorageResult<Vec<String>>;

    /// Drop expired and completed records, returning how many were removed.
    async fn purge_stale(&self) -> StorageResult<usize> {
        Ok(0)
    }
}

/// Selects and configures a storage provider.
#[derive(Clone, Debug)]
pub enum StorageConfig {
    InMemory {
        /// Max pending records per subscriber queue.
        /// Default: 1000
        queue_capacity: usize,
    },
    Persistent {
        /// Directory holding the event log.
        path: PathBuf,
        /// Run [`StorageProvider::purge_stale`] on this interval (None = never).
        purge_interval: Option<Duration>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::InMemory {
            queue_capacity: InMemoryStorage::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// The configured storage provider.
pub enum Storage {
    InMemory(InMemoryStorage),
    Persistent(PersistentStorage),
}

impl Storage {
    /// Build the provider described by `config`.
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        match config {
            StorageConfig::InMemory { queue_capacity } => {
                Ok(Storage::InMemory(InMemoryStorage::with_capacity(*queue_capacity)))
            }
            StorageConfig::Persistent { path, .. } => {
                Ok(Storage::Persistent(PersistentStorage::open_or_create(path)?))
            }
        }
    }

    /// Start background maintenance for the provider, if configured.
    ///
    /// Only the persistent provider with a `purge_interval` has any; the
    /// returned task stops when `shutdown` is cancelled.
    pub fn spawn_maintenance(
        &self,
        config: &StorageConfig,
        shutdown: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        match (self, config) {
            (
                Storage::Persistent(storage),
                StorageConfig::Persistent {
                    purge_interval: Some(interval),
                    ..
                },
            ) => Some(storage.spawn_purge_task(*interval, shutdown)),
            _ => None,
        }
    }
}

#[async_trait]
impl StorageProvider for Storage {
    fn kind(&self) -> StorageKind {
        match self {
            Storage::InMemory(s) => s.kind(),
            Storage::Persistent(s) => s.kind(),
        }
    }

    async fn store_event(&self, record: EventRecord) -> StorageResult<()> {
        match self {
            Storage::InMemory(s) => s.store_event(record).await,
            Storage::Persistent(s) => s.store_event(record).await,
        }
    }

    async fn get_next_batch(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> StorageResult<Vec<EventRecord>> {
        match self {
            Storage::InMemory(s) => s.get_next_batch(filter, limit).await,
            Storage::Persistent(s) => s.get_next_batch(filter, limit).await,
        }
    }

    async fn mark_event_as_complete(&self, record: &EventRecord) -> StorageResult<()> {
        match self {
            Storage::InMemory(s) => s.mark_event_as_complete(record).await,
            Storage::Persistent(s) => s.mark_event_as_complete(record).await,
        }
    }

    async fn restore_subscriber_ids(&self, event_type: &str) -> StorageResult<Vec<String>> {
        match self {
            Storage::InMemory(s) => s.restore_subscriber_ids(event_type).await,
            Storage::Persistent(s) => s.restore_subscriber_ids(event_type).await,
        }
    }

    async fn purge_stale(&self) -> StorageResult<usize> {
        match self {
            Storage::InMemory(s) => s.purge_stale().await,
            Storage::Persistent(s) => s.purge_stale().await,
        }
    }
}
