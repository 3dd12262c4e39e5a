//! Fetch loop for pull backends.
//!
//! `idle → active → (fetch → dispatch)* → stopped`
//!
//! Each fetch races the consumer's cancel handle, so a stop never waits for a
//! long-poll to time out. Dispatch does not wait for handlers: shutdown waits
//! on the in-flight count, not on the loop.

use crate::backoff::Backoff;
use crate::error::AppError;
use crate::pipeline::Pipeline;
use queue_runtime::PullProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "polling_tests.rs"]
mod tests;

/// Fetch settings of one polling loop
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollSettings {
    pub(crate) batch_size: u32,
    pub(crate) wait: Duration,
    pub(crate) backoff: Backoff,
}

/// Run the fetch loop until shutdown or the failure ceiling.
///
/// Returns [`AppError::PollingFailed`] when consecutive fetch failures reach
/// the backoff's ceiling; returns `Ok` after a regular shutdown.
pub(crate) async fn run_polling_loop<C>(
    pipeline: Arc<Pipeline<C>>,
    provider: Arc<dyn PullProvider>,
    settings: PollSettings,
) -> Result<(), AppError>
where
    C: Send + Sync + 'static,
{
    let state = Arc::clone(pipeline.state());
    let queue = pipeline.queue().clone();
    let cancel = state.cancel_token().clone();

    if state.is_shutting_down() {
        return Ok(());
    }
    state.set_polling_active(true);
    info!(queue = %queue, batch_size = settings.batch_size, "Polling loop started");

    let mut failures: u32 = 0;
    let result = loop {
        if !state.is_polling_active() || state.is_shutting_down() {
            break Ok(());
        }

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            fetched = provider.receive_messages(&queue, settings.batch_size, settings.wait) => {
                Some(fetched)
            }
        };
        let Some(fetched) = fetched else {
            continue;
        };

        match fetched {
            Ok(batch) => {
                failures = 0;
                if !batch.is_empty() {
                    debug!(queue = %queue, count = batch.len(), "Fetched batch");
                }
                for message in batch {
                    pipeline.dispatch(message);
                }
            }
            Err(e) if state.is_shutting_down() => {
                debug!(queue = %queue, error = %e, "Fetch failed during shutdown");
            }
            Err(e) => {
                failures += 1;

                if settings.backoff.is_fatal(failures) {
                    error!(
                        queue = %queue,
                        failures,
                        error = %e,
                        "Too many consecutive fetch failures; stopping polling loop"
                    );
                    state.set_polling_active(false);
                    break Err(AppError::PollingFailed {
                        queue: queue.to_string(),
                        failures,
                        last_error: e.to_string(),
                    });
                }

                let delay = settings.backoff.delay_for(failures);
                warn!(
                    queue = %queue,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    transient = e.is_transient(),
                    error = %e,
                    "Fetch failed; backing off"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    };

    info!(queue = %queue, in_flight = state.in_flight(), "Polling loop stopped");
    result
}
