//! The per-message processing pipeline.
//!
//! admission → correlate → decode → invoke → reply → acknowledge
//!
//! | Outcome | Backend call |
//! |---|---|
//! | refused (shutting down) | `abandon_message` (redeliver) |
//! | handler succeeded | `complete_message` |
//! | decode or handler failure | `dead_letter_message` (no redelivery) |
//!
//! Handler failures never escape: they become an error reply (when a reply
//! destination exists) and a terminal rejection.

use crate::config::DecodePolicy;
use crate::correlation::Correlation;
use crate::error::{AppError, HandlerError};
use crate::handler::{MessageContext, MessageHandler};
use crate::reply::{Reply, ReplyTransport};
use crate::state::{ConsumerState, InFlightGuard};
use futures::FutureExt;
use queue_runtime::{Backend, QueueName, ReceivedMessage};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;

pub(crate) struct Pipeline<C> {
    queue: QueueName,
    handler: Arc<dyn MessageHandler<C>>,
    backend: Backend,
    replies: Arc<dyn ReplyTransport>,
    state: Arc<ConsumerState>,
    app: Arc<C>,
    decode_policy: DecodePolicy,
}

impl<C> Pipeline<C>
where
    C: Send + Sync + 'static,
{
    pub(crate) fn new(
        queue: QueueName,
        handler: Arc<dyn MessageHandler<C>>,
        backend: Backend,
        replies: Arc<dyn ReplyTransport>,
        app: Arc<C>,
        decode_policy: DecodePolicy,
    ) -> Self {
        Self {
            queue,
            handler,
            backend,
            replies,
            state: ConsumerState::new(),
            app,
            decode_policy,
        }
    }

    pub(crate) fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub(crate) fn state(&self) -> &Arc<ConsumerState> {
        &self.state
    }

    /// Admit `message` now and process it on its own task.
    ///
    /// Admission happens before this returns, so the in-flight count covers
    /// the spawned work from the moment it exists.
    pub(crate) fn dispatch(self: &Arc<Self>, message: ReceivedMessage) {
        let pipeline = Arc::clone(self);
        match self.state.try_enter() {
            Some(guard) => {
                tokio::spawn(async move { pipeline.run(message, guard).await });
            }
            None => {
                let guard = self.state.track();
                tokio::spawn(async move {
                    pipeline.release(message).await;
                    drop(guard);
                });
            }
        }
    }

    /// Hand a refused message back to the backend for redelivery
    async fn release(&self, message: ReceivedMessage) {
        debug!(
            queue = %self.queue,
            message_id = %message.message_id,
            "Shutting down; releasing message for redelivery"
        );

        if let Err(e) = self.backend.abandon_message(&message.receipt_handle).await {
            warn!(
                queue = %self.queue,
                message_id = %message.message_id,
                error = %e,
                "Failed to release message"
            );
        }
    }

    async fn run(&self, message: ReceivedMessage, guard: InFlightGuard) {
        let correlation = Correlation::resolve(&message);
        let span = info_span!(
            "message",
            queue = %self.queue,
            message_id = %message.message_id,
            correlation_id = %correlation.correlation_id,
            delivery_count = message.delivery_count,
        );

        self.process_admitted(message, correlation, span.clone())
            .instrument(span)
            .await;

        drop(guard);
    }

    async fn process_admitted(
        &self,
        message: ReceivedMessage,
        correlation: Correlation,
        span: tracing::Span,
    ) {
        debug!(
            generated_correlation_id = correlation.generated,
            reply_requested = correlation.wants_reply(),
            "Processing message"
        );

        let outcome = match self.invoke(&message, &correlation, span).await {
            Ok(data) => self.reply_success(&correlation, data).await,
            Err(failure) => Err(failure),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.backend.complete_message(&message.receipt_handle).await {
                    warn!(error = %e, "Failed to acknowledge message");
                } else {
                    debug!("Message acknowledged");
                }
            }
            Err(failure) => {
                warn!(
                    kind = %failure.kind,
                    error = %failure.message,
                    "Message processing failed"
                );

                if let Some(reply_to) = &correlation.reply_to {
                    let reply = Reply::error(correlation.correlation_id.clone(), &failure);
                    self.deliver(reply_to, &reply).await;
                }

                if let Err(e) = self
                    .backend
                    .dead_letter_message(&message.receipt_handle, &failure.message)
                    .await
                {
                    warn!(error = %e, "Failed to reject message");
                } else {
                    debug!("Message rejected without redelivery");
                }
            }
        }
    }

    /// Decode the payload and run the handler, converting panics to errors
    async fn invoke(
        &self,
        message: &ReceivedMessage,
        correlation: &Correlation,
        span: tracing::Span,
    ) -> Result<Value, HandlerError> {
        let content = match serde_json::from_slice::<Value>(&message.body) {
            Ok(content) => content,
            Err(e) => match self.decode_policy {
                DecodePolicy::Reject => return Err(HandlerError::from(e)),
                DecodePolicy::EmptyObject => {
                    warn!(error = %e, "Payload is not valid JSON; using an empty object");
                    Value::Object(Map::new())
                }
            },
        };

        let ctx = MessageContext::new(
            Arc::clone(&self.app),
            correlation.correlation_id.clone(),
            correlation.reply_to.clone(),
            message.message_id.clone(),
            self.queue.clone(),
            message.delivery_count,
            span,
        );

        match AssertUnwindSafe(self.handler.handle(content, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let detail = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(HandlerError::panic(format!("handler panicked: {}", detail)))
            }
        }
    }

    /// Send the success reply, if one was requested.
    ///
    /// An envelope that cannot be encoded turns the outcome into a failure;
    /// a delivery failure is only logged.
    async fn reply_success(
        &self,
        correlation: &Correlation,
        data: Value,
    ) -> Result<(), HandlerError> {
        let Some(reply_to) = &correlation.reply_to else {
            return Ok(());
        };

        let reply = Reply::success(correlation.correlation_id.clone(), data);
        match self.replies.send_reply(reply_to, &reply).await {
            Err(AppError::Serialization(e)) => Err(HandlerError::new(format!(
                "failed to encode reply: {}",
                e
            ))),
            Err(e) => {
                warn!(reply_to = %reply_to, error = %e, "Failed to deliver reply");
                Ok(())
            }
            Ok(()) => {
                debug!(reply_to = %reply_to, "Reply delivered");
                Ok(())
            }
        }
    }

    async fn deliver(&self, reply_to: &str, reply: &Reply) {
        match self.replies.send_reply(reply_to, reply).await {
            Ok(()) => debug!(reply_to = %reply_to, "Error reply delivered"),
            Err(e) => warn!(reply_to = %reply_to, error = %e, "Failed to deliver error reply"),
        }
    }
}
