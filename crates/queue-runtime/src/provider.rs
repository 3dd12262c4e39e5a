//! Provider types and configuration.

use std::time::Duration;

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderType {
    /// Push-subscription broker with ack/nak/term semantics
    InMemoryBroker,
    /// Pull-polling queue with visibility timeouts
    InMemoryQueue,
}

impl ProviderType {
    /// How messages arrive from this provider
    pub fn delivery_mode(&self) -> DeliveryMode {
        match self {
            Self::InMemoryBroker => DeliveryMode::Push,
            Self::InMemoryQueue => DeliveryMode::Pull,
        }
    }

    /// Get maximum number of messages returned by one fetch
    pub fn max_batch_size(&self) -> u32 {
        match self {
            Self::InMemoryBroker => 1,
            Self::InMemoryQueue => 10,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InMemoryBroker => write!(f, "InMemoryBroker"),
            Self::InMemoryQueue => write!(f, "InMemoryQueue"),
        }
    }
}

/// How a provider hands messages to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The broker pushes messages through a subscription
    Push,
    /// The consumer polls the queue for batches
    Pull,
}

/// In-memory pull queue configuration
#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    /// How long a received message stays invisible before it is redelivered
    pub visibility_timeout: Duration,
    /// Maximum queue depth; sends beyond it are rejected
    pub max_queue_size: usize,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_queue_size: 10000,
        }
    }
}

/// In-memory push broker configuration
#[derive(Debug, Clone, Default)]
pub struct InMemoryBrokerConfig {
    /// Maximum number of pending messages per subject (`None` = unbounded)
    pub max_pending: Option<usize>,
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
