//! Joined cancellation for subscriber loops and publishes.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Either the caller's token or process shutdown ends the operation.
#[derive(Clone, Debug)]
pub(crate) struct Cancellation {
    caller: CancellationToken,
    shutdown: CancellationToken,
}

impl Cancellation {
    pub(crate) fn new(caller: CancellationToken, shutdown: CancellationToken) -> Self {
        Self { caller, shutdown }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.caller.is_cancelled() || self.shutdown.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        tokio::select! {
            _ = self.caller.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Sleep for `duration`. Returns false if cancelled first.
    pub(crate) async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
