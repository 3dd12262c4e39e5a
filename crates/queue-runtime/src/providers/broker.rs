//! In-memory push broker for testing and development.
//!
//! Subjects are created on first use. Each subject accepts one active
//! subscription at a time; messages published while nobody listens wait in
//! the subject until a subscriber arrives.
//!
//! Acknowledgment follows broker conventions: `ack` removes the message, `nak`
//! puts it back at the head of the subject for immediate redelivery, and
//! `term` parks it without redelivery.

use crate::client::{PushProvider, QueueProvider, Subscription};
use crate::error::QueueError;
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use crate::provider::{InMemoryBrokerConfig, ProviderType};
use crate::providers::memory::{DeadLetter, StoredMessage};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;

#[derive(Default)]
struct Subject {
    pending: VecDeque<StoredMessage>,
    /// Delivered, awaiting ack/nak/term; keyed by receipt handle
    unacked: HashMap<String, StoredMessage>,
    dead_letter: Vec<DeadLetter>,
    acked: usize,
    subscribed: bool,
}

#[derive(Default)]
struct BrokerState {
    subjects: HashMap<QueueName, Subject>,
    closed: bool,
}

fn lock_state(state: &Mutex<BrokerState>) -> Result<MutexGuard<'_, BrokerState>, QueueError> {
    state.lock().map_err(|_| QueueError::ProviderError {
        provider: ProviderType::InMemoryBroker.to_string(),
        code: "LockPoisoned".to_string(),
        message: "broker state lock poisoned".to_string(),
    })
}

fn closed_error() -> QueueError {
    QueueError::ConnectionClosed {
        provider: ProviderType::InMemoryBroker.to_string(),
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory push broker
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    config: InMemoryBrokerConfig,
}

impl InMemoryBroker {
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    /// Messages published but not yet delivered
    pub fn pending_count(&self, subject: &QueueName) -> usize {
        self.inspect(subject, |s| s.pending.len())
    }

    /// Messages delivered and awaiting acknowledgment
    pub fn unacked_count(&self, subject: &QueueName) -> usize {
        self.inspect(subject, |s| s.unacked.len())
    }

    pub fn acked_count(&self, subject: &QueueName) -> usize {
        self.inspect(subject, |s| s.acked)
    }

    pub fn dead_letter_count(&self, subject: &QueueName) -> usize {
        self.inspect(subject, |s| s.dead_letter.len())
    }

    /// Terminated messages with their rejection reasons, oldest first
    pub fn dead_lettered(&self, subject: &QueueName) -> Vec<(MessageId, String)> {
        self.inspect(subject, |s| {
            s.dead_letter
                .iter()
                .map(|d| (d.message.message_id.clone(), d.reason.clone()))
                .collect()
        })
    }

    /// Whether a subscription is currently attached to `subject`
    pub fn has_subscriber(&self, subject: &QueueName) -> bool {
        self.inspect(subject, |s| s.subscribed)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    fn inspect<T: Default>(&self, subject: &QueueName, f: impl FnOnce(&Subject) -> T) -> T {
        match self.state.lock() {
            Ok(state) => state.subjects.get(subject).map(f).unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, QueueError> {
        let state = lock_state(&self.state)?;
        if state.closed {
            return Err(closed_error());
        }
        Ok(state)
    }

    fn take_unacked(
        state: &mut BrokerState,
        receipt: &ReceiptHandle,
    ) -> Result<StoredMessage, QueueError> {
        state
            .subjects
            .get_mut(receipt.queue())
            .and_then(|subject| subject.unacked.remove(receipt.handle()))
            .ok_or_else(|| QueueError::MessageNotFound {
                receipt: receipt.to_string(),
            })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

#[async_trait]
impl QueueProvider for InMemoryBroker {
    async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError> {
        let message_id = {
            let mut state = self.open_state()?;
            let subject = state.subjects.entry(queue.clone()).or_default();

            if let Some(limit) = self.config.max_pending {
                if subject.pending.len() >= limit {
                    return Err(QueueError::ProviderError {
                        provider: ProviderType::InMemoryBroker.to_string(),
                        code: "SubjectFull".to_string(),
                        message: format!("subject '{}' has {} pending messages", queue, limit),
                    });
                }
            }

            let stored = StoredMessage::from_message(message);
            let message_id = stored.message_id.clone();
            subject.pending.push_back(stored);
            message_id
        };

        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.open_state()?;
        Self::take_unacked(&mut state, receipt)?;
        if let Some(subject) = state.subjects.get_mut(receipt.queue()) {
            subject.acked += 1;
        }
        tracing::trace!(receipt = %receipt, "Message acked");
        Ok(())
    }

    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        {
            let mut state = self.open_state()?;
            let message = Self::take_unacked(&mut state, receipt)?;
            if let Some(subject) = state.subjects.get_mut(receipt.queue()) {
                subject.pending.push_front(message);
            }
        }

        self.notify.notify_waiters();
        tracing::trace!(receipt = %receipt, "Message nak'd");
        Ok(())
    }

    async fn dead_letter_message(
        &self,
        receipt: &ReceiptHandle,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.open_state()?;
        let message = Self::take_unacked(&mut state, receipt)?;
        if let Some(subject) = state.subjects.get_mut(receipt.queue()) {
            subject.dead_letter.push(DeadLetter {
                message,
                reason: reason.to_string(),
            });
        }
        tracing::trace!(receipt = %receipt, reason, "Message terminated");
        Ok(())
    }

    async fn verify_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let mut state = self.open_state()?;
        state.subjects.entry(queue.clone()).or_default();
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        {
            let mut state = lock_state(&self.state)?;
            state.closed = true;
        }

        self.notify.notify_waiters();
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemoryBroker
    }
}

#[async_trait]
impl PushProvider for InMemoryBroker {
    async fn subscribe(
        &self,
        queue: &QueueName,
        durable_name: Option<&str>,
    ) -> Result<Box<dyn Subscription>, QueueError> {
        {
            let mut state = self.open_state()?;
            let subject = state.subjects.entry(queue.clone()).or_default();
            if subject.subscribed {
                return Err(QueueError::SubscriptionActive {
                    queue_name: queue.to_string(),
                });
            }
            subject.subscribed = true;
        }

        tracing::debug!(subject = %queue, durable_name, "Subscription established");

        Ok(Box::new(InMemorySubscription {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            subject: queue.clone(),
            closed: false,
        }))
    }
}

// ============================================================================
// InMemorySubscription
// ============================================================================

/// Subscription handed out by [`InMemoryBroker`]
pub struct InMemorySubscription {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    subject: QueueName,
    closed: bool,
}

impl InMemorySubscription {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Ok(mut state) = self.state.lock() {
            if let Some(subject) = state.subjects.get_mut(&self.subject) {
                subject.subscribed = false;
            }
        }
        self.notify.notify_waiters();
    }

    /// Take the next pending message; `Err(())` once the broker is closed
    fn try_next(&self) -> Result<Option<ReceivedMessage>, ()> {
        let mut state = self.state.lock().map_err(|_| ())?;
        if state.closed {
            return Err(());
        }

        let Some(subject) = state.subjects.get_mut(&self.subject) else {
            return Ok(None);
        };
        let Some(mut stored) = subject.pending.pop_front() else {
            return Ok(None);
        };

        let received = stored.deliver(&self.subject, ProviderType::InMemoryBroker);
        subject
            .unacked
            .insert(received.receipt_handle.handle().to_string(), stored);
        Ok(Some(received))
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_message(&mut self) -> Option<ReceivedMessage> {
        loop {
            if self.closed {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_next() {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(()) => return None,
            }

            notified.await;
        }
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.release();
        tracing::debug!(subject = %self.subject, "Subscription closed");
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}
