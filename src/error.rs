//! Error types for the event hub.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by storage providers.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Queue for subscriber {subscriber_id} is full (capacity {capacity})")]
    CapacityExceeded {
        subscriber_id: String,
        capacity: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Storage is locked by another process")]
    Locked,

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether this error means the subscriber's bounded queue is full.
    ///
    /// Everything else is treated as transient by the hub.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, StorageError::CapacityExceeded { .. })
    }
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StorageError::Deserialization(e.to_string())
    }
}

/// Main error type for hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No hub registered for event type: {0}")]
    UnregisteredEventType(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Failed to initialize hub for {event_type}: {source}")]
    Initialization {
        event_type: String,
        #[source]
        source: Box<HubError>,
    },

    #[error("Hub initialization did not succeed within {elapsed:?}: {last_error}")]
    BootTimeout {
        elapsed: Duration,
        last_error: Box<HubError>,
    },

    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Codec(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for HubError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        HubError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for HubError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        HubError::Codec(e.to_string())
    }
}

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;
