//! Binding of one queue or subject to one pipeline.

use crate::config::QueueBinding;
use crate::error::AppError;
use crate::pipeline::Pipeline;
use crate::polling::{run_polling_loop, PollSettings};
use crate::state::ConsumerState;
use queue_runtime::{Backend, QueueError, Subscription};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

type SubscriptionSlot = Mutex<Option<Box<dyn Subscription>>>;

pub(crate) struct Consumer<C> {
    binding: QueueBinding,
    pipeline: Arc<Pipeline<C>>,
    poll: PollSettings,
    subscription: Arc<SubscriptionSlot>,
}

impl<C> Consumer<C>
where
    C: Send + Sync + 'static,
{
    pub(crate) fn new(binding: QueueBinding, pipeline: Pipeline<C>, poll: PollSettings) -> Self {
        Self {
            binding,
            pipeline: Arc::new(pipeline),
            poll,
            subscription: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.binding.name
    }

    pub(crate) fn state(&self) -> &Arc<ConsumerState> {
        self.pipeline.state()
    }

    /// Establish the push subscription; no-op for pull backends
    pub(crate) async fn subscribe(&self, backend: &Backend) -> Result<(), AppError> {
        let Backend::Push(provider) = backend else {
            return Ok(());
        };

        let subscription = provider
            .subscribe(self.pipeline.queue(), self.binding.durable_name.as_deref())
            .await?;
        *self.subscription.lock().await = Some(subscription);

        info!(
            queue = %self.binding.name,
            durable_name = self.binding.durable_name.as_deref(),
            "Subscribed"
        );
        Ok(())
    }

    /// Spawn the receive loop matching the backend's delivery mode
    pub(crate) fn spawn_receive(
        &self,
        backend: &Backend,
    ) -> tokio::task::JoinHandle<Result<(), AppError>> {
        let receiving = self.state().start_receiving();
        let pipeline = Arc::clone(&self.pipeline);

        match backend {
            Backend::Pull(provider) => {
                let provider = Arc::clone(provider);
                let poll = self.poll;
                tokio::spawn(async move {
                    let result = run_polling_loop(pipeline, provider, poll).await;
                    drop(receiving);
                    result
                })
            }
            Backend::Push(_) => {
                let slot = Arc::clone(&self.subscription);
                tokio::spawn(async move {
                    let result = run_push_loop(pipeline, slot).await;
                    drop(receiving);
                    result
                })
            }
        }
    }

    /// Close the push subscription so the broker stops delivering.
    ///
    /// Must run after the receive loop has exited; the loop holds the slot
    /// while it waits for messages.
    pub(crate) async fn close_subscription(&self) -> Result<(), QueueError> {
        let subscription = self.subscription.lock().await.take();
        match subscription {
            Some(mut subscription) => {
                debug!(queue = %self.binding.name, "Closing subscription");
                subscription.close().await
            }
            None => Ok(()),
        }
    }
}

/// Deliver pushed messages into the pipeline until cancelled or the
/// subscription ends
async fn run_push_loop<C>(
    pipeline: Arc<Pipeline<C>>,
    slot: Arc<SubscriptionSlot>,
) -> Result<(), AppError>
where
    C: Send + Sync + 'static,
{
    let state = Arc::clone(pipeline.state());
    let cancel = state.cancel_token().clone();
    let queue = pipeline.queue().clone();

    let mut guard = slot.lock().await;
    let Some(subscription) = guard.as_mut() else {
        return Ok(());
    };

    info!(queue = %queue, "Push consumer started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = subscription.next_message() => next,
        };

        match next {
            Some(message) => pipeline.dispatch(message),
            None => {
                info!(queue = %queue, "Subscription ended");
                break;
            }
        }
    }

    info!(queue = %queue, in_flight = state.in_flight(), "Push consumer stopped");
    Ok(())
}
