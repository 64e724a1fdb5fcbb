//! Broadcast path: choose candidates, store one record each, wake them.

use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cancel::Cancellation;
use super::HubCore;
use crate::types::EventRecord;

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers chosen to receive the event.
    pub candidates: Vec<String>,
    /// Records successfully stored.
    pub stored: usize,
    /// Subscribers evicted because their queue was full.
    pub evicted: Vec<String>,
    /// The broadcast was cancelled before every candidate was handled.
    pub cancelled: bool,
}

/// Picks the next round-robin recipient.
///
/// Candidates are considered in id order; the pick is the first id after the
/// previous recipient, wrapping around. With two or more candidates the
/// previous recipient is therefore never picked twice in a row.
#[derive(Debug, Default)]
pub struct RoundRobinCursor {
    last: Mutex<Option<String>>,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose from `connected`, which must be sorted and free of duplicates.
    pub fn next(&self, connected: &[String]) -> Option<String> {
        let mut last = self.last.lock();
        let pick = match last.as_deref() {
            Some(prev) => connected
                .iter()
                .find(|id| id.as_str() > prev)
                .or_else(|| connected.first()),
            None => connected.first(),
        }
        .cloned();

        if pick.is_some() {
            *last = pick.clone();
        }
        pick
    }

    /// The most recent recipient.
    pub fn last(&self) -> Option<String> {
        self.last.lock().clone()
    }
}

impl HubCore {
    /// Queue an encoded event for this hub's candidate subscribers.
    ///
    /// Waits up to `candidate_wait_limit` for a candidate to appear, then
    /// gives up with a warning. Storage failures are retried until `cancel`
    /// fires; a full queue evicts that subscriber and drops its copy.
    pub async fn broadcast_raw(&self, payload: Vec<u8>, cancel: CancellationToken) -> BroadcastReport {
        let cancel = Cancellation::new(cancel, self.shutdown.clone());
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let mut report = BroadcastReport {
            candidates: self.wait_for_candidates(&cancel).await,
            ..Default::default()
        };

        if report.candidates.is_empty() {
            report.cancelled = cancel.is_cancelled();
            if !report.cancelled {
                tracing::warn!(
                    event_type = %self.event_type,
                    "No subscribers available, event not queued"
                );
            }
            return report;
        }

        for subscriber_id in report.candidates.clone() {
            let record = EventRecord::new(
                subscriber_id.as_str(),
                self.event_type.as_str(),
                payload.clone(),
                self.config.record_expiry,
            );

            let mut attempt = 0u32;
            loop {
                match self.storage.store_event(record.clone()).await {
                    Ok(()) => {
                        report.stored += 1;
                        self.counters.stored.fetch_add(1, Ordering::Relaxed);
                        if let Some(subscriber) = self.registry.get(&subscriber_id) {
                            subscriber.wake();
                        }
                        break;
                    }
                    Err(e) if e.is_capacity_exceeded() => {
                        self.registry.evict(&subscriber_id);
                        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                        report.evicted.push(subscriber_id.clone());
                        tracing::warn!(
                            event_type = %self.event_type,
                            subscriber = %subscriber_id,
                            error = %e,
                            "Subscriber queue overflowed, subscriber evicted"
                        );
                        if let Some(ref errors) = self.errors {
                            errors.on_queue_overflow(&record, &e);
                        }
                        break;
                    }
                    Err(e) => {
                        attempt += 1;
                        self.counters.transient_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            event_type = %self.event_type,
                            subscriber = %subscriber_id,
                            attempt = attempt,
                            error = %e,
                            "Failed to store event record, retrying"
                        );
                        if let Some(ref errors) = self.errors {
                            errors.on_store_error(&record, attempt, &e);
                        }
                        if !cancel.sleep(self.config.retry_backoff).await {
                            report.cancelled = true;
                            return report;
                        }
                    }
                }
            }
        }

        report
    }

    /// Current candidate set for the configured mode.
    fn choose_candidates(&self) -> Vec<String> {
        if !self.config.mode.is_round_robin() {
            return self.registry.ids();
        }

        let connected = self.registry.connected_ids();
        self.cursor.next(&connected).into_iter().collect()
    }

    async fn wait_for_candidates(&self, cancel: &Cancellation) -> Vec<String> {
        let started = Instant::now();
        loop {
            let candidates = self.choose_candidates();
            if !candidates.is_empty() || cancel.is_cancelled() {
                return candidates;
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.candidate_wait_limit {
                return candidates;
            }

            let wait = self
                .config
                .retry_backoff
                .min(self.config.candidate_wait_limit - elapsed);
            if !cancel.sleep(wait).await {
                return Vec::new();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rotation_skips_last_recipient() {
        let cursor = RoundRobinCursor::new();
        let connected = ids(&["A", "B", "C"]);

        assert_eq!(cursor.next(&connected).as_deref(), Some("A"));
        assert_eq!(cursor.next(&connected).as_deref(), Some("B"));
        assert_eq!(cursor.next(&connected).as_deref(), Some("C"));
        assert_eq!(cursor.next(&connected).as_deref(), Some("A"));
    }

    #[test]
    fn test_rotation_after_b_picks_c_then_not_c() {
        let cursor = RoundRobinCursor::new();
        *cursor.last.lock() = Some("B".to_string());
        let connected = ids(&["A", "B", "C"]);

        assert_eq!(cursor.next(&connected).as_deref(), Some("C"));
        assert_ne!(cursor.next(&connected).as_deref(), Some("C"));
    }

    #[test]
    fn test_rotation_when_last_recipient_left() {
        let cursor = RoundRobinCursor::new();
        *cursor.last.lock() = Some("B".to_string());

        assert_eq!(cursor.next(&ids(&["A", "C"])).as_deref(), Some("C"));
        assert_eq!(cursor.next(&ids(&["A"])).as_deref(), Some("A"));
        assert_eq!(cursor.next(&[]), None);
        assert_eq!(cursor.last().as_deref(), Some("A"));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn rotation_never_repeats_with_two_or_more(
                set in proptest::collection::btree_set("[a-z]{1,4}", 2..8),
                publishes in 1usize..50,
            ) {
                let connected: Vec<String> = set.into_iter().collect();
                let cursor = RoundRobinCursor::new();

                let mut previous: Option<String> = None;
                let mut seen = std::collections::BTreeSet::new();
                for _ in 0..publishes {
                    let pick = cursor.next(&connected).unwrap();
                    prop_assert!(connected.contains(&pick));
                    prop_assert_ne!(Some(&pick), previous.as_ref());
                    seen.insert(pick.clone());
                    previous = Some(pick);
                }

                // A full cycle visits every candidate.
                if publishes >= connected.len() {
                    prop_assert_eq!(seen.len(), connected.len());
                }
            }
        }
    }
}
