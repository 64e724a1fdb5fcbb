//! Per-event-type subscriber bookkeeping.
//!
//! A [`SubscriberRegistry`] belongs to exactly one hub. It tracks every
//! subscriber id the hub knows about, whether a stream is currently open for
//! it, and the wake signal publishers use to rouse an idle delivery loop.
//!
//! Subscribers are created lazily: either restored from storage at boot or on
//! their first stream connection. They are only removed when their queue
//! overflows, at which point their wake signal is closed so any waiting loop
//! returns immediately and notices the eviction.

mod registry;
mod subscriber;

pub use registry::SubscriberRegistry;
pub use subscriber::{Subscriber, WakeOutcome};
