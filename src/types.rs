//! Core types for the event hub.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// An event that can be broadcast through a hub.
///
/// Each hub serves exactly one event type, identified by [`Event::event_type`].
/// The default name is the full Rust type path, so producers and subscribers
/// in other processes must either share the type or override the name.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name used to route events to their hub.
    fn event_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Unique identifier for a stored record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        RecordId(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// This timestamp moved forward by `duration`.
    pub fn after(self, duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }

    /// This timestamp moved back by `duration`.
    pub fn before(self, duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(micros))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// One event queued for one subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier (assigned on creation).
    pub id: RecordId,

    /// Subscriber this record is addressed to.
    pub subscriber_id: String,

    /// Name of the event type (see [`Event::event_type`]).
    pub event_type: String,

    /// The serialized event.
    pub payload: Vec<u8>,

    /// Set once the record has been delivered.
    pub is_complete: bool,

    /// The record is not delivered after this instant.
    pub expire_on: Timestamp,
}

impl EventRecord {
    /// Create a pending record that expires `ttl` from now.
    pub fn new(
        subscriber_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: RecordId::new(),
            subscriber_id: subscriber_id.into(),
            event_type: event_type.into(),
            payload,
            is_complete: false,
            expire_on: Timestamp::now().after(ttl),
        }
    }

    /// Whether the record is still eligible for delivery at `now`.
    pub fn is_pending(&self, now: Timestamp) -> bool {
        !self.is_complete && now <= self.expire_on
    }
}

/// Selects the records a subscriber is due.
///
/// Providers return only records matching every field.
#[derive(Clone, Debug)]
pub struct RecordFilter {
    pub event_type: String,
    pub subscriber_id: String,
    pub now: Timestamp,
}

impl RecordFilter {
    pub fn new(event_type: impl Into<String>, subscriber_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            subscriber_id: subscriber_id.into(),
            now: Timestamp::now(),
        }
    }

    /// Check if a record matches this filter.
    pub fn matches(&self, record: &EventRecord) -> bool {
        record.event_type == self.event_type
            && record.subscriber_id == self.subscriber_id
            && record.is_pending(self.now)
    }
}
