//! A single subscriber's shared state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// How an idle wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeOutcome {
    /// A publish released the wake signal.
    Woken,
    /// The poll ceiling elapsed first.
    TimedOut,
    /// The signal was closed because the subscriber was evicted.
    Closed,
}

/// State shared between a subscriber's delivery loop and publishers.
#[derive(Debug)]
pub struct Subscriber {
    id: String,
    /// Open streams for this id; more than one is allowed.
    connections: AtomicUsize,
    /// Wake signal holding at most one permit, starts at zero.
    wake: Semaphore,
}

impl Subscriber {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connections: AtomicUsize::new(0),
            wake: Semaphore::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether at least one stream is open for this subscriber.
    pub fn is_connected(&self) -> bool {
        self.connections.load(Ordering::Acquire) > 0
    }

    pub(crate) fn connect(&self) {
        self.connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn disconnect(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Release the wake permit if none is outstanding.
    ///
    /// Wakes coalesce: any number of publishes while the loop is away leave a
    /// single permit, and one fetch drains everything they queued.
    pub fn wake(&self) {
        if !self.wake.is_closed() && self.wake.available_permits() == 0 {
            self.wake.add_permits(1);
        }
    }

    /// Wait for a wake permit, at most `ceiling`.
    pub async fn wait_for_wake(&self, ceiling: Duration) -> WakeOutcome {
        match tokio::time::timeout(ceiling, self.wake.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                WakeOutcome::Woken
            }
            Ok(Err(_)) => WakeOutcome::Closed,
            Err(_) => WakeOutcome::TimedOut,
        }
    }

    /// Close the wake signal; current and future waits return [`WakeOutcome::Closed`].
    pub(crate) fn close(&self) {
        self.wake.close();
    }

    pub fn is_closed(&self) -> bool {
        self.wake.is_closed()
    }
}
