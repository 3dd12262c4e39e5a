//! Queue provider implementations.
//!
//! This module contains in-memory implementations of the `PushProvider` and
//! `PullProvider` traits, one per delivery mode.

pub mod broker;
pub mod memory;

pub use broker::{InMemoryBroker, InMemorySubscription};
pub use memory::InMemoryQueueProvider;
