//! The handler contract.
//!
//! Handlers receive the decoded payload together with a [`MessageContext`]
//! that carries the application context and the per-message metadata. Any
//! `async` closure or function with the matching signature is a handler:
//!
//! ```rust
//! use queue_app::{HandlerError, MessageContext};
//! use serde_json::{json, Value};
//!
//! async fn on_order(content: Value, ctx: MessageContext<()>) -> Result<Value, HandlerError> {
//!     tracing::info!(order = %content["id"], "Processing order");
//!     Ok(json!({ "accepted": true, "correlationId": ctx.correlation_id() }))
//! }
//! ```

use crate::error::HandlerError;
use async_trait::async_trait;
use queue_runtime::{MessageId, QueueName};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;

/// Per-message view handed to the handler
///
/// The span is the message's logging scope: it carries the correlation id,
/// and the handler future already runs inside it, so plain `tracing` macros
/// inherit those fields. Use [`span`](Self::span) to attach the scope to
/// work spawned onto other tasks.
pub struct MessageContext<C> {
    app: Arc<C>,
    correlation_id: String,
    reply_to: Option<String>,
    message_id: MessageId,
    queue: QueueName,
    delivery_count: u32,
    span: tracing::Span,
}

impl<C> MessageContext<C> {
    pub(crate) fn new(
        app: Arc<C>,
        correlation_id: String,
        reply_to: Option<String>,
        message_id: MessageId,
        queue: QueueName,
        delivery_count: u32,
        span: tracing::Span,
    ) -> Self {
        Self {
            app,
            correlation_id,
            reply_to,
            message_id,
            queue,
            delivery_count,
            span,
        }
    }

    /// Application-supplied context shared by every message
    pub fn app(&self) -> &Arc<C> {
        &self.app
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Where the reply will be delivered, if one was requested
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Queue or subject the message arrived on
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// How many times this message has been delivered, starting at 1
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl<C> Clone for MessageContext<C> {
    fn clone(&self) -> Self {
        Self {
            app: Arc::clone(&self.app),
            correlation_id: self.correlation_id.clone(),
            reply_to: self.reply_to.clone(),
            message_id: self.message_id.clone(),
            queue: self.queue.clone(),
            delivery_count: self.delivery_count,
            span: self.span.clone(),
        }
    }
}

impl<C> std::fmt::Debug for MessageContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("message_id", &self.message_id)
            .field("queue", &self.queue)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Processes one decoded message
///
/// An `Ok` value becomes the `data` of the success reply; an `Err` becomes
/// the error reply and terminally rejects the message.
#[async_trait]
pub trait MessageHandler<C>: Send + Sync
where
    C: Send + Sync + 'static,
{
    async fn handle(&self, content: Value, ctx: MessageContext<C>) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<C, F, Fut> MessageHandler<C> for F
where
    C: Send + Sync + 'static,
    F: Fn(Value, MessageContext<C>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, content: Value, ctx: MessageContext<C>) -> Result<Value, HandlerError> {
        (self)(content, ctx).await
    }
}
