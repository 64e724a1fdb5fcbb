//! # Event Hub
//!
//! Per-event-type broadcasting with at-least-once delivery to long-lived
//! subscriber streams.
//!
//! ## Core Concepts
//!
//! - **Hubs**: one per event type; fan out (or rotate) published events into
//!   per-subscriber queues and stream them back out
//! - **Storage**: pluggable queues, bounded in memory or a durable log on disk
//! - **Directory**: event-type keyed lookup used for routing and at boot
//! - **Transport**: framed TCP protocol for remote subscribers and broker publishes
//!
//! ## Example
//!
//! ```ignore
//! use eventhub::{HubConfig, HubDirectory, InMemoryStorage, Event};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderCreated { id: u64 }
//! impl Event for OrderCreated {}
//!
//! let shutdown = CancellationToken::new();
//! let directory = HubDirectory::new(HubConfig::default(), shutdown.clone());
//! let hub = directory.create_hub::<OrderCreated>(Arc::new(InMemoryStorage::new()));
//!
//! eventhub::boot::initialize_with_retry(&directory, shutdown.clone()).await?;
//!
//! let mut orders = hub.subscribe("billing");
//! directory.route(&OrderCreated { id: 1 }, CancellationToken::new()).await?;
//! let order = orders.recv().await.unwrap()?;
//! ```

pub mod boot;
pub mod codec;
pub mod config;
pub mod directory;
pub mod error;
pub mod frame;
pub mod hub;
pub mod storage;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use boot::{initialize_with_retry, BootOutcome};
pub use codec::Codec;
pub use config::{HubConfig, HubMode};
pub use directory::HubDirectory;
pub use error::{HubError, Result, StorageError};
pub use hub::{
    BroadcastReport, ErrorReceiver, EventSink, Hub, HubCore, HubStats, RoundRobinCursor,
    SinkClosed, Subscription,
};
pub use storage::{
    InMemoryStorage, PersistentStorage, Storage, StorageConfig, StorageKind, StorageProvider,
};
pub use subscriptions::{Subscriber, SubscriberRegistry};
pub use transport::{HubClient, HubServer, RemoteSubscription, ServerConfig};
pub use types::{Event, EventRecord, RecordFilter, RecordId, Timestamp};
