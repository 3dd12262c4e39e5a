//! Provider traits and the backend dispatcher.
//!
//! Push brokers and pull queues differ only in how messages arrive. Both share
//! the acknowledgment capability set on [`QueueProvider`]:
//!
//! | Outcome | Push broker | Pull queue |
//! |---|---|---|
//! | [`abandon_message`](QueueProvider::abandon_message) | nak, redeliver now | visibility timeout reset to 0 |
//! | [`complete_message`](QueueProvider::complete_message) | ack | delete |
//! | [`dead_letter_message`](QueueProvider::dead_letter_message) | term (no redelivery) | delete (no redelivery) |

use crate::error::QueueError;
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use crate::provider::{DeliveryMode, ProviderType};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Capabilities shared by every queue backend
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Send single message to a queue or subject
    async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError>;

    /// Mark message as successfully processed
    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Release message for immediate redelivery
    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Reject message permanently; it is never redelivered
    async fn dead_letter_message(
        &self,
        receipt: &ReceiptHandle,
        reason: &str,
    ) -> Result<(), QueueError>;

    /// Confirm the queue exists and the connection is usable
    async fn verify_queue(&self, queue: &QueueName) -> Result<(), QueueError>;

    /// Release the underlying connection. Calling it again is a no-op.
    async fn close(&self) -> Result<(), QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Backends that hand out messages in polled batches
#[async_trait]
pub trait PullProvider: QueueProvider {
    /// Fetch up to `max_messages`, waiting at most `wait` for the first one.
    ///
    /// An empty batch means the wait elapsed without messages.
    async fn receive_messages(
        &self,
        queue: &QueueName,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;
}

/// Backends that push messages through a subscription
#[async_trait]
pub trait PushProvider: QueueProvider {
    /// Start consuming `queue`, optionally under a durable consumer name
    async fn subscribe(
        &self,
        queue: &QueueName,
        durable_name: Option<&str>,
    ) -> Result<Box<dyn Subscription>, QueueError>;
}

/// An active push subscription
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivered message; `None` once the subscription ends.
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next_message(&mut self) -> Option<ReceivedMessage>;

    /// Stop delivery. Undelivered messages stay with the broker.
    async fn close(&mut self) -> Result<(), QueueError>;
}

/// A connected backend of either delivery mode
///
/// The shared capability set is exposed directly so callers that only
/// acknowledge or publish never need to know the delivery mode.
#[derive(Clone)]
pub enum Backend {
    Pull(Arc<dyn PullProvider>),
    Push(Arc<dyn PushProvider>),
}

impl Backend {
    /// Wrap a pull provider
    pub fn pull<P: PullProvider + 'static>(provider: Arc<P>) -> Self {
        Self::Pull(provider)
    }

    /// Wrap a push provider
    pub fn push<P: PushProvider + 'static>(provider: Arc<P>) -> Self {
        Self::Push(provider)
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        match self {
            Self::Pull(_) => DeliveryMode::Pull,
            Self::Push(_) => DeliveryMode::Push,
        }
    }

    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::Pull(p) => p.provider_type(),
            Self::Push(p) => p.provider_type(),
        }
    }

    pub async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError> {
        match self {
            Self::Pull(p) => p.send_message(queue, message).await,
            Self::Push(p) => p.send_message(queue, message).await,
        }
    }

    pub async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        match self {
            Self::Pull(p) => p.complete_message(receipt).await,
            Self::Push(p) => p.complete_message(receipt).await,
        }
    }

    pub async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        match self {
            Self::Pull(p) => p.abandon_message(receipt).await,
            Self::Push(p) => p.abandon_message(receipt).await,
        }
    }

    pub async fn dead_letter_message(
        &self,
        receipt: &ReceiptHandle,
        reason: &str,
    ) -> Result<(), QueueError> {
        match self {
            Self::Pull(p) => p.dead_letter_message(receipt, reason).await,
            Self::Push(p) => p.dead_letter_message(receipt, reason).await,
        }
    }

    pub async fn verify_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        match self {
            Self::Pull(p) => p.verify_queue(queue).await,
            Self::Push(p) => p.verify_queue(queue).await,
        }
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        match self {
            Self::Pull(p) => p.close().await,
            Self::Push(p) => p.close().await,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.provider_type()).finish()
    }
}
