//! In-memory pull queue provider for testing and development.
//!
//! This module provides a fully functional polling queue that:
//! - Hands out messages in batches with a long-poll wait
//! - Hides received messages for a visibility timeout and redelivers them
//!   when the timeout expires without a completion
//! - Parks rejected messages in a dead letter list instead of redelivering
//! - Provides thread-safe concurrent access
//!
//! It mirrors the semantics of hosted polling queues closely enough to act as
//! the reference backend for consumer tests.

use crate::client::{PullProvider, QueueProvider};
use crate::error::QueueError;
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp};
use crate::provider::{InMemoryQueueConfig, ProviderType};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message held by an in-memory provider
#[derive(Clone)]
pub(crate) struct StoredMessage {
    pub(crate) message_id: MessageId,
    pub(crate) body: Bytes,
    pub(crate) attributes: HashMap<String, String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) reply_to: Option<String>,
    pub(crate) delivery_count: u32,
}

impl StoredMessage {
    pub(crate) fn from_message(message: Message) -> Self {
        Self {
            message_id: MessageId::new(),
            body: message.body,
            attributes: message.attributes,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            delivery_count: 0,
        }
    }

    /// Produce a delivery of this message under a fresh receipt handle
    pub(crate) fn deliver(
        &mut self,
        queue: &QueueName,
        provider_type: ProviderType,
    ) -> ReceivedMessage {
        self.delivery_count += 1;
        let receipt = ReceiptHandle::new(
            uuid::Uuid::new_v4().to_string(),
            queue.clone(),
            provider_type,
        );

        ReceivedMessage {
            message_id: self.message_id.clone(),
            body: self.body.clone(),
            attributes: self.attributes.clone(),
            correlation_id: self.correlation_id.clone(),
            reply_to: self.reply_to.clone(),
            receipt_handle: receipt,
            delivery_count: self.delivery_count,
            delivered_at: Timestamp::now(),
        }
    }
}

/// A rejected message together with the rejection reason
#[derive(Clone)]
pub(crate) struct DeadLetter {
    pub(crate) message: StoredMessage,
    pub(crate) reason: String,
}

/// A message currently hidden while a consumer processes it
struct InFlightMessage {
    message: StoredMessage,
    /// `None` when the visibility timeout is too long to represent
    visible_at: Option<Instant>,
}

/// Internal queue state for a single queue
#[derive(Default)]
struct InMemoryQueue {
    /// Visible messages (FIFO order)
    messages: VecDeque<StoredMessage>,
    /// Received but not yet completed, keyed by receipt handle
    in_flight: HashMap<String, InFlightMessage>,
    /// Rejected messages, never redelivered
    dead_letter: Vec<DeadLetter>,
}

impl InMemoryQueue {
    /// Return in-flight messages whose visibility timeout has expired
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at.is_some_and(|at| at <= now))
            .map(|(handle, _)| handle.clone())
            .collect();

        for handle in expired {
            if let Some(entry) = self.in_flight.remove(&handle) {
                self.messages.push_back(entry.message);
            }
        }
    }

    /// Earliest instant at which an in-flight message becomes visible again
    fn next_visibility(&self) -> Option<Instant> {
        self.in_flight.values().filter_map(|entry| entry.visible_at).min()
    }
}

/// Thread-safe storage for all queues
#[derive(Default)]
struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
    closed: bool,
    injected_receive_failures: u32,
}

impl QueueStorage {
    fn queue_mut(&mut self, queue_name: &QueueName) -> Result<&mut InMemoryQueue, QueueError> {
        self.queues
            .get_mut(queue_name)
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: queue_name.to_string(),
            })
    }

    fn queue(&self, queue_name: &QueueName) -> Option<&InMemoryQueue> {
        self.queues.get(queue_name)
    }
}

// ============================================================================
// InMemoryQueueProvider
// ============================================================================

/// In-memory pull queue provider implementation
pub struct InMemoryQueueProvider {
    storage: Arc<Mutex<QueueStorage>>,
    notify: Arc<Notify>,
    config: InMemoryQueueConfig,
}

impl InMemoryQueueProvider {
    /// Create new in-memory provider with configuration
    pub fn new(config: InMemoryQueueConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(QueueStorage::default())),
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    /// Create a queue. Creating an existing queue is a no-op.
    pub fn create_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let mut storage = self.open_storage()?;
        storage.queues.entry(queue.clone()).or_default();
        Ok(())
    }

    /// Make the next `count` receive calls fail with a connection error
    pub fn inject_receive_failures(&self, count: u32) {
        if let Ok(mut storage) = self.storage.lock() {
            storage.injected_receive_failures = count;
        }
    }

    /// Number of messages waiting to be received (excludes in-flight)
    pub fn queue_depth(&self, queue: &QueueName) -> usize {
        self.inspect(queue, |q| q.messages.len())
    }

    /// Number of messages received but not yet completed or released
    pub fn in_flight_count(&self, queue: &QueueName) -> usize {
        self.inspect(queue, |q| q.in_flight.len())
    }

    /// Number of messages rejected without redelivery
    pub fn dead_letter_count(&self, queue: &QueueName) -> usize {
        self.inspect(queue, |q| q.dead_letter.len())
    }

    /// Rejection reasons of dead-lettered messages, oldest first
    pub fn dead_letter_reasons(&self, queue: &QueueName) -> Vec<String> {
        self.inspect(queue, |q| {
            q.dead_letter.iter().map(|d| d.reason.clone()).collect()
        })
    }

    /// Whether [`close`](QueueProvider::close) has been called
    pub fn is_closed(&self) -> bool {
        self.storage.lock().map(|s| s.closed).unwrap_or(true)
    }

    fn inspect<T: Default>(&self, queue: &QueueName, f: impl FnOnce(&InMemoryQueue) -> T) -> T {
        match self.storage.lock() {
            Ok(storage) => storage.queue(queue).map(f).unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    fn lock_storage(&self) -> Result<MutexGuard<'_, QueueStorage>, QueueError> {
        self.storage.lock().map_err(|_| QueueError::ProviderError {
            provider: ProviderType::InMemoryQueue.to_string(),
            code: "LockPoisoned".to_string(),
            message: "queue storage lock poisoned".to_string(),
        })
    }

    fn open_storage(&self) -> Result<MutexGuard<'_, QueueStorage>, QueueError> {
        let storage = self.lock_storage()?;
        if storage.closed {
            return Err(QueueError::ConnectionClosed {
                provider: ProviderType::InMemoryQueue.to_string(),
            });
        }
        Ok(storage)
    }

    /// Remove an in-flight entry identified by `receipt`
    fn take_in_flight(
        storage: &mut QueueStorage,
        receipt: &ReceiptHandle,
    ) -> Result<StoredMessage, QueueError> {
        storage
            .queue_mut(receipt.queue())?
            .in_flight
            .remove(receipt.handle())
            .map(|entry| entry.message)
            .ok_or_else(|| QueueError::MessageNotFound {
                receipt: receipt.to_string(),
            })
    }
}

impl Default for InMemoryQueueProvider {
    fn default() -> Self {
        Self::new(InMemoryQueueConfig::default())
    }
}

#[async_trait]
impl QueueProvider for InMemoryQueueProvider {
    async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError> {
        let message_id = {
            let mut storage = self.open_storage()?;
            let max_queue_size = self.config.max_queue_size;
            let target = storage.queue_mut(queue)?;

            if target.messages.len() + target.in_flight.len() >= max_queue_size {
                return Err(QueueError::ProviderError {
                    provider: ProviderType::InMemoryQueue.to_string(),
                    code: "QueueFull".to_string(),
                    message: format!("queue '{}' holds {} messages", queue, max_queue_size),
                });
            }

            let stored = StoredMessage::from_message(message);
            let message_id = stored.message_id.clone();
            target.messages.push_back(stored);
            message_id
        };

        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut storage = self.open_storage()?;
        Self::take_in_flight(&mut storage, receipt)?;
        tracing::trace!(receipt = %receipt, "Message deleted");
        Ok(())
    }

    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        {
            let mut storage = self.open_storage()?;
            let message = Self::take_in_flight(&mut storage, receipt)?;
            storage.queue_mut(receipt.queue())?.messages.push_front(message);
        }

        self.notify.notify_waiters();
        tracing::trace!(receipt = %receipt, "Message visibility reset");
        Ok(())
    }

    async fn dead_letter_message(
        &self,
        receipt: &ReceiptHandle,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut storage = self.open_storage()?;
        let message = Self::take_in_flight(&mut storage, receipt)?;
        storage
            .queue_mut(receipt.queue())?
            .dead_letter
            .push(DeadLetter {
                message,
                reason: reason.to_string(),
            });
        tracing::trace!(receipt = %receipt, reason, "Message dead-lettered");
        Ok(())
    }

    async fn verify_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let mut storage = self.open_storage()?;
        storage.queue_mut(queue).map(|_| ())
    }

    async fn close(&self) -> Result<(), QueueError> {
        {
            let mut storage = self.lock_storage()?;
            storage.closed = true;
        }

        // Wake long-polls so they observe the closed state
        self.notify.notify_waiters();
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemoryQueue
    }
}

#[async_trait]
impl PullProvider for InMemoryQueueProvider {
    async fn receive_messages(
        &self,
        queue: &QueueName,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let max_messages = max_messages.clamp(1, ProviderType::InMemoryQueue.max_batch_size());
        // A wait too long to represent has no deadline
        let deadline = Instant::now().checked_add(wait);

        loop {
            // Register for wakeups before inspecting state so a concurrent
            // send between the check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visibility = {
                let mut storage = self.open_storage()?;

                if storage.injected_receive_failures > 0 {
                    storage.injected_receive_failures -= 1;
                    return Err(QueueError::ConnectionFailed {
                        message: "injected receive failure".to_string(),
                    });
                }

                let now = Instant::now();
                let visibility_timeout = self.config.visibility_timeout;
                let target = storage.queue_mut(queue)?;
                target.reclaim_expired(now);

                let mut batch = Vec::new();
                while batch.len() < max_messages as usize {
                    let Some(mut stored) = target.messages.pop_front() else {
                        break;
                    };
                    let received = stored.deliver(queue, ProviderType::InMemoryQueue);
                    target.in_flight.insert(
                        received.receipt_handle.handle().to_string(),
                        InFlightMessage {
                            message: stored,
                            visible_at: now.checked_add(visibility_timeout),
                        },
                    );
                    batch.push(received);
                }

                if !batch.is_empty() {
                    return Ok(batch);
                }

                target.next_visibility()
            };

            if deadline.is_some_and(|at| Instant::now() >= at) {
                return Ok(Vec::new());
            }

            let wake_at = match (next_visibility, deadline) {
                (Some(visible), Some(deadline)) => Some(visible.min(deadline)),
                (visible, deadline) => visible.or(deadline),
            };
            match wake_at {
                Some(wake_at) => tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(wake_at) => {}
                },
                None => notified.await,
            }
        }
    }
}
