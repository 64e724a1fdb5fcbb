//! Subscriber delivery loop.
//!
//! One loop runs per open stream. It drains the subscriber's queue in
//! batches, writes each record to the stream, and settles it with storage:
//!
//! - persistent storage: mark complete after a successful write;
//! - in-memory storage: the read already removed the record, so a failed
//!   write puts the undelivered records back.
//!
//! A failed write ends the loop; the client reconnects with the same id and
//! picks up from the oldest pending record.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::cancel::Cancellation;
use super::HubCore;
use crate::codec::Codec;
use crate::error::Result;
use crate::storage::StorageKind;
use crate::subscriptions::{Subscriber, WakeOutcome};
use crate::types::{Event, EventRecord, RecordFilter};

/// The subscriber's stream is gone.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("subscriber stream closed")]
pub struct SinkClosed;

/// Outgoing side of a subscriber stream.
#[async_trait]
pub trait EventSink: Send {
    /// Write one record. Returns once the record has been handed over.
    async fn send(&mut self, record: &EventRecord) -> std::result::Result<(), SinkClosed>;
}

/// Why a delivery loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// Caller or process cancellation.
    Cancelled,
    /// A write failed.
    StreamClosed,
    /// The subscriber was removed for queue overflow.
    Evicted,
}

impl HubCore {
    /// Run the delivery loop for `subscriber_id` until the stream breaks,
    /// `cancel` fires, or the hub shuts down.
    pub async fn run_subscriber<S>(&self, subscriber_id: &str, sink: &mut S, cancel: CancellationToken)
    where
        S: EventSink + ?Sized,
    {
        let cancel = Cancellation::new(cancel, self.shutdown.clone());
        let subscriber = self.registry.get_or_insert(subscriber_id);
        subscriber.connect();

        tracing::info!(
            event_type = %self.event_type,
            subscriber = %subscriber_id,
            "Subscriber connected"
        );

        let exit = self.stream_loop(&subscriber, sink, &cancel).await;
        subscriber.disconnect();

        tracing::info!(
            event_type = %self.event_type,
            subscriber = %subscriber_id,
            reason = ?exit,
            "Subscriber disconnected"
        );
    }

    async fn stream_loop<S>(
        &self,
        subscriber: &Arc<Subscriber>,
        sink: &mut S,
        cancel: &Cancellation,
    ) -> LoopExit
    where
        S: EventSink + ?Sized,
    {
        let mut fetch_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return LoopExit::Cancelled;
            }

            let filter = RecordFilter::new(self.event_type.as_str(), subscriber.id());
            let batch = match self
                .storage
                .get_next_batch(&filter, self.config.batch_size)
                .await
            {
                Ok(batch) => {
                    fetch_failures = 0;
                    batch
                }
                Err(e) => {
                    fetch_failures += 1;
                    self.counters.transient_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event_type = %self.event_type,
                        subscriber = %subscriber.id(),
                        attempt = fetch_failures,
                        error = %e,
                        "Failed to fetch next batch, retrying"
                    );
                    if let Some(ref errors) = self.errors {
                        errors.on_get_next_batch_error(
                            &self.event_type,
                            subscriber.id(),
                            fetch_failures,
                            &e,
                        );
                    }
                    if !cancel.sleep(self.config.retry_backoff).await {
                        return LoopExit::Cancelled;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                let outcome = tokio::select! {
                    outcome = subscriber.wait_for_wake(self.config.idle_poll_ceiling) => outcome,
                    _ = cancel.cancelled() => return LoopExit::Cancelled,
                };
                // Closed only happens on eviction, which already removed the entry.
                if outcome == WakeOutcome::Closed {
                    debug_assert!(!self.registry.is_current(subscriber));
                    return LoopExit::Evicted;
                }
                continue;
            }

            let mut records = batch.into_iter();
            while let Some(record) = records.next() {
                // A completed hand-over wins over a concurrent cancel.
                let sent = tokio::select! {
                    biased;
                    sent = sink.send(&record) => sent,
                    _ = cancel.cancelled() => Err(SinkClosed),
                };

                if sent.is_err() {
                    self.requeue(std::iter::once(record).chain(records)).await;
                    return if cancel.is_cancelled() {
                        LoopExit::Cancelled
                    } else {
                        LoopExit::StreamClosed
                    };
                }

                self.counters.delivered.fetch_add(1, Ordering::Relaxed);

                if self.storage.kind() == StorageKind::Persistent
                    && !self.mark_complete(&record, cancel).await
                {
                    return LoopExit::Cancelled;
                }
            }
        }
    }

    /// Mark a delivered record complete, retrying until it sticks.
    ///
    /// Returns false if cancelled first; the record then stays pending and is
    /// delivered again on the next connection.
    async fn mark_complete(&self, record: &EventRecord, cancel: &Cancellation) -> bool {
        let mut attempt = 0u32;
        loop {
            match self.storage.mark_event_as_complete(record).await {
                Ok(()) => return true,
                Err(e) => {
                    attempt += 1;
                    self.counters.transient_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event_type = %self.event_type,
                        subscriber = %record.subscriber_id,
                        record = %record.id,
                        attempt = attempt,
                        error = %e,
                        "Failed to mark record complete, retrying"
                    );
                    if let Some(ref errors) = self.errors {
                        errors.on_mark_complete_error(record, attempt, &e);
                    }
                    if !cancel.sleep(self.config.retry_backoff).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Put undelivered records back into an in-memory queue. Best effort.
    async fn requeue<I>(&self, records: I)
    where
        I: Iterator<Item = EventRecord>,
    {
        if self.storage.kind() != StorageKind::InMemory {
            return;
        }

        for record in records {
            let id = record.id;
            let subscriber = record.subscriber_id.clone();
            if let Err(e) = self.storage.store_event(record).await {
                tracing::debug!(
                    event_type = %self.event_type,
                    subscriber = %subscriber,
                    record = %id,
                    error = %e,
                    "Dropped undelivered record"
                );
            }
        }
    }
}

/// In-process sink; hands payloads to a [`Subscription`] and waits for pickup.
pub(crate) struct ChannelSink {
    tx: mpsc::Sender<(Vec<u8>, oneshot::Sender<()>)>,
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, record: &EventRecord) -> std::result::Result<(), SinkClosed> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((record.payload.clone(), ack_tx))
            .await
            .map_err(|_| SinkClosed)?;
        ack_rx.await.map_err(|_| SinkClosed)
    }
}

/// Typed in-process stream of events for one subscriber.
///
/// A record only counts as delivered once [`Subscription::recv`] has taken it,
/// so dropping the subscription never loses queued events.
pub struct Subscription<E: Event> {
    subscriber_id: String,
    rx: mpsc::Receiver<(Vec<u8>, oneshot::Sender<()>)>,
    codec: Codec,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Event> Subscription<E> {
    pub(crate) fn spawn(core: Arc<HubCore>, subscriber_id: String) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let codec = core.codec();

        let task = {
            let cancel = cancel.clone();
            let subscriber_id = subscriber_id.clone();
            tokio::spawn(async move {
                let mut sink = ChannelSink { tx };
                core.run_subscriber(&subscriber_id, &mut sink, cancel).await;
            })
        };

        Self {
            subscriber_id,
            rx,
            codec,
            cancel,
            task,
            _marker: PhantomData,
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Next event, or `None` once the delivery loop has ended.
    pub async fn recv(&mut self) -> Option<Result<E>> {
        let (payload, ack) = self.rx.recv().await?;
        let _ = ack.send(());
        Some(self.codec.decode(&payload))
    }

    /// Stop the delivery loop and wait for it to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        let _ = (&mut self.task).await;
    }
}

impl<E: Event> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
