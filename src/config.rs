//! Hub configuration.
//!
//! A [`HubConfig`] is built once at startup and shared by every hub through
//! the [`HubDirectory`](crate::HubDirectory). Changing it after hubs exist is
//! not supported.

use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

use crate::codec::Codec;

/// Delivery mode flags.
///
/// Flags combine with `|`, e.g. `HubMode::EVENT_BROKER | HubMode::ROUND_ROBIN`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HubMode(u8);

impl HubMode {
    /// Fan every event out to all known subscribers.
    pub const EVENT_PUBLISHER: HubMode = HubMode(1);
    /// Also accept events published by remote producers over the wire.
    pub const EVENT_BROKER: HubMode = HubMode(1 << 1);
    /// Deliver each event to exactly one connected subscriber, rotating.
    pub const ROUND_ROBIN: HubMode = HubMode(1 << 2);

    /// Check if all flags in `other` are set.
    pub fn contains(self, other: HubMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_broker(self) -> bool {
        self.contains(HubMode::EVENT_BROKER)
    }

    pub fn is_round_robin(self) -> bool {
        self.contains(HubMode::ROUND_ROBIN)
    }
}

impl Default for HubMode {
    fn default() -> Self {
        HubMode::EVENT_PUBLISHER
    }
}

impl BitOr for HubMode {
    type Output = HubMode;

    fn bitor(self, rhs: HubMode) -> HubMode {
        HubMode(self.0 | rhs.0)
    }
}

impl fmt::Debug for HubMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(HubMode::EVENT_PUBLISHER) {
            names.push("EVENT_PUBLISHER");
        }
        if self.is_broker() {
            names.push("EVENT_BROKER");
        }
        if self.is_round_robin() {
            names.push("ROUND_ROBIN");
        }
        write!(f, "HubMode({})", names.join(" | "))
    }
}

/// Process-wide hub settings.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Delivery mode.
    pub mode: HubMode,

    /// Max records fetched per poll of a subscriber's queue.
    /// Default: 25
    pub batch_size: usize,

    /// How long a stored record stays deliverable.
    /// Default: 4 hours
    pub record_expiry: Duration,

    /// Longest an idle subscriber loop sleeps before polling again.
    /// Default: 60s
    pub idle_poll_ceiling: Duration,

    /// Delay between retries of failed storage calls.
    /// Default: 5s
    pub retry_backoff: Duration,

    /// How long a publish waits for at least one candidate subscriber.
    /// Default: 60s
    pub candidate_wait_limit: Duration,

    /// Total time allowed for hub initialization at boot.
    /// Default: 30s
    pub boot_timeout: Duration,

    /// Delay between boot initialization attempts.
    /// Default: 5s
    pub boot_retry_interval: Duration,

    /// Payload codec.
    pub codec: Codec,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mode: HubMode::default(),
            batch_size: 25,
            record_expiry: Duration::from_secs(4 * 60 * 60),
            idle_poll_ceiling: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(5),
            candidate_wait_limit: Duration::from_secs(60),
            boot_timeout: Duration::from_secs(30),
            boot_retry_interval: Duration::from_secs(5),
            codec: Codec::default(),
        }
    }
}

impl HubConfig {
    /// Create a config with the given mode and default timings.
    pub fn with_mode(mode: HubMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Set the delivery mode
    pub fn mode(mut self, mode: HubMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the fetch batch size (at least 1)
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the record expiry
    pub fn record_expiry(mut self, expiry: Duration) -> Self {
        self.record_expiry = expiry;
        self
    }

    /// Set the idle poll ceiling
    pub fn idle_poll_ceiling(mut self, ceiling: Duration) -> Self {
        self.idle_poll_ceiling = ceiling;
        self
    }

    /// Set the storage retry backoff
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set how long a publish waits for candidates
    pub fn candidate_wait_limit(mut self, limit: Duration) -> Self {
        self.candidate_wait_limit = limit;
        self
    }

    /// Set the boot timeout and retry interval
    pub fn boot(mut self, timeout: Duration, retry_interval: Duration) -> Self {
        self.boot_timeout = timeout;
        self.boot_retry_interval = retry_interval;
        self
    }

    /// Set the payload codec
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }
}
