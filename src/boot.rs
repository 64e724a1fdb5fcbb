//! Startup: initialize every hub, retrying until it works or time runs out.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::directory::HubDirectory;
use crate::error::{HubError, Result};

/// How boot ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// All hubs initialized; safe to start serving.
    Ready,
    /// Shutdown was requested while retrying.
    Cancelled,
}

/// Run [`HubDirectory::initialize_all`] until it succeeds.
///
/// Failures are retried every `boot_retry_interval`. Once `boot_timeout` has
/// elapsed the last failure is returned as [`HubError::BootTimeout`], which
/// callers should treat as fatal.
pub async fn initialize_with_retry(
    directory: &HubDirectory,
    cancel: CancellationToken,
) -> Result<BootOutcome> {
    let config = directory.config();
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let error = match directory.initialize_all().await {
            Ok(()) => {
                tracing::info!(
                    hubs = directory.len(),
                    attempts = attempt,
                    "Hub directory ready"
                );
                return Ok(BootOutcome::Ready);
            }
            Err(e) => e,
        };

        if cancel.is_cancelled() || directory.shutdown_token().is_cancelled() {
            tracing::info!("Boot cancelled");
            return Ok(BootOutcome::Cancelled);
        }

        let elapsed = started.elapsed();
        if elapsed >= config.boot_timeout {
            tracing::error!(
                attempts = attempt,
                elapsed = ?elapsed,
                error = %error,
                "Hub initialization timed out"
            );
            return Err(HubError::BootTimeout {
                elapsed,
                last_error: Box::new(error),
            });
        }

        tracing::warn!(
            attempt = attempt,
            retry_in = ?config.boot_retry_interval,
            error = %error,
            "Hub initialization failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(config.boot_retry_interval) => {}
            _ = cancel.cancelled() => {
                tracing::info!("Boot cancelled");
                return Ok(BootOutcome::Cancelled);
            }
            _ = directory.shutdown_token().cancelled() => {
                tracing::info!("Boot cancelled");
                return Ok(BootOutcome::Cancelled);
            }
        }
    }
}
