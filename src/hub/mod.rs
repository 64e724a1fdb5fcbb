//! Per-event-type hubs.
//!
//! A hub owns the subscriber registry for one event type and drives both
//! directions of traffic:
//!
//! ```text
//!   broadcast(event)                          run_subscriber(id, sink)
//!        │                                             ▲
//!        ▼                                             │
//!   choose candidates ──► storage.store_event ──► get_next_batch ──► sink.send
//!   (fan-out / rotate)    + wake subscriber        (poll / idle wait)  + mark complete
//! ```
//!
//! [`HubCore`] is type-erased and works on encoded payloads so it can sit in
//! the [`HubDirectory`](crate::HubDirectory) and serve the wire transport.
//! [`Hub<E>`] is the typed handle applications use.

mod cancel;
mod publish;
mod receiver;
mod subscribe;

pub use publish::{BroadcastReport, RoundRobinCursor};
pub use receiver::ErrorReceiver;
pub use subscribe::{EventSink, SinkClosed, Subscription};

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::config::HubConfig;
use crate::error::Result;
use crate::storage::StorageProvider;
use crate::subscriptions::SubscriberRegistry;
use crate::types::Event;

/// Running counters for one hub.
#[derive(Debug, Default)]
struct HubCounters {
    published: AtomicU64,
    stored: AtomicU64,
    delivered: AtomicU64,
    transient_errors: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of a hub's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    pub event_type: String,
    /// Known subscribers.
    pub subscribers: usize,
    /// Subscribers with an open stream.
    pub connected: usize,
    /// Events broadcast.
    pub published: u64,
    /// Records written to storage.
    pub stored: u64,
    /// Records written to a subscriber stream.
    pub delivered: u64,
    /// Storage calls that failed and were retried.
    pub transient_errors: u64,
    /// Subscribers evicted for queue overflow.
    pub evictions: u64,
}

/// Type-erased hub for one event type.
pub struct HubCore {
    event_type: String,
    config: Arc<HubConfig>,
    storage: Arc<dyn StorageProvider>,
    registry: SubscriberRegistry,
    cursor: RoundRobinCursor,
    errors: Option<Arc<dyn ErrorReceiver>>,
    shutdown: CancellationToken,
    counters: HubCounters,
}

impl HubCore {
    pub fn new(
        event_type: impl Into<String>,
        config: Arc<HubConfig>,
        storage: Arc<dyn StorageProvider>,
        shutdown: CancellationToken,
        errors: Option<Arc<dyn ErrorReceiver>>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            config,
            storage,
            registry: SubscriberRegistry::new(),
            cursor: RoundRobinCursor::new(),
            errors,
            shutdown,
            counters: HubCounters::default(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn codec(&self) -> Codec {
        self.config.codec
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    /// Token cancelled on process shutdown.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Recognize every subscriber that still has pending records.
    ///
    /// Called once at boot, before any stream connects.
    pub async fn initialize(&self) -> Result<()> {
        let ids = self
            .storage
            .restore_subscriber_ids(&self.event_type)
            .await?;
        let restored = self.registry.restore(ids);

        tracing::info!(
            event_type = %self.event_type,
            restored = restored,
            subscribers = self.registry.len(),
            mode = ?self.config.mode,
            "Hub initialized"
        );

        Ok(())
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            event_type: self.event_type.clone(),
            subscribers: self.registry.len(),
            connected: self.registry.connected_ids().len(),
            published: self.counters.published.load(Ordering::Relaxed),
            stored: self.counters.stored.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            transient_errors: self.counters.transient_errors.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Typed handle to the hub for event type `E`.
pub struct Hub<E: Event> {
    core: Arc<HubCore>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Event> Clone for Hub<E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<E: Event> Hub<E> {
    /// Create a hub for `E`.
    ///
    /// Most applications go through
    /// [`HubDirectory::create_hub`](crate::HubDirectory::create_hub) instead,
    /// which supplies the shared config and shutdown token.
    pub fn new(
        config: Arc<HubConfig>,
        storage: Arc<dyn StorageProvider>,
        shutdown: CancellationToken,
        errors: Option<Arc<dyn ErrorReceiver>>,
    ) -> Self {
        Self {
            core: Arc::new(HubCore::new(
                E::event_type(),
                config,
                storage,
                shutdown,
                errors,
            )),
            _marker: PhantomData,
        }
    }

    pub fn core(&self) -> &Arc<HubCore> {
        &self.core
    }

    pub fn event_type(&self) -> &str {
        self.core.event_type()
    }

    pub async fn initialize(&self) -> Result<()> {
        self.core.initialize().await
    }

    /// Encode `event` and queue it for its candidate subscribers.
    pub async fn broadcast(&self, event: &E, cancel: CancellationToken) -> Result<BroadcastReport> {
        let payload = self.core.codec().encode(event)?;
        Ok(self.core.broadcast_raw(payload, cancel).await)
    }

    /// Open an in-process stream for `subscriber_id`.
    ///
    /// The delivery loop runs on its own task until the returned
    /// [`Subscription`] is dropped or closed, or the hub shuts down.
    pub fn subscribe(&self, subscriber_id: impl Into<String>) -> Subscription<E> {
        Subscription::spawn(Arc::clone(&self.core), subscriber_id.into())
    }

    pub fn stats(&self) -> HubStats {
        self.core.stats()
    }
}
