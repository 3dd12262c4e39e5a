//! # Queue Runtime
//!
//! Backend abstraction for queue consumer applications, covering both
//! push-subscription brokers and pull-polling queues.
//!
//! This library provides:
//! - A single capability set for acknowledging messages across backends
//! - Pull (batch fetch) and push (subscription) delivery traits
//! - In-memory reference providers for both delivery modes
//! - An expiring key/value store usable as a reply channel
//!
//! ## Module Organization
//!
//! - [error] - Error types for all queue operations
//! - [message] - Message structures and receipt handles
//! - [provider] - Provider types and configuration
//! - [client] - Provider traits and the [`Backend`] dispatcher
//! - [providers] - In-memory provider implementations
//! - [store] - Key/value store with expiring keys

pub mod client;
pub mod error;
pub mod message;
pub mod provider;
pub mod providers;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use client::{Backend, PullProvider, PushProvider, QueueProvider, Subscription};
pub use error::{ConfigurationError, QueueError, ValidationError};
pub use message::{
    Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp,
    CORRELATION_ID_ATTRIBUTES, REPLY_TO_ATTRIBUTES,
};
pub use provider::{DeliveryMode, InMemoryBrokerConfig, InMemoryQueueConfig, ProviderType};
pub use providers::{InMemoryBroker, InMemoryQueueProvider};
pub use store::{InMemoryKeyValueStore, KeyValueStore};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
