//! Application configuration.
//!
//! Every field carries a serde default, so an empty document produces a
//! valid configuration apart from the queue list, which callers must fill.

use crate::error::AppError;
use queue_runtime::QueueName;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Consumer application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// One consumer is created per entry
    pub queues: Vec<QueueBinding>,

    /// Fetch settings for pull backends
    pub polling: PollingConfig,

    /// Backoff after failed fetches
    pub backoff: BackoffConfig,

    pub shutdown: ShutdownConfig,

    pub reply: ReplyConfig,

    /// What to do with payloads that are not valid JSON
    pub decode_policy: DecodePolicy,
}

impl AppConfig {
    /// Add a queue binding
    pub fn with_queue(mut self, binding: QueueBinding) -> Self {
        self.queues.push(binding);
        self
    }

    /// Check the configuration for values the runtime cannot work with
    pub fn validate(&self) -> Result<(), AppError> {
        if self.queues.is_empty() {
            return Err(invalid("at least one queue must be configured"));
        }

        let mut seen = HashSet::new();
        for binding in &self.queues {
            QueueName::new(binding.name.clone()).map_err(|e| {
                invalid(format!("queue name '{}' is invalid: {}", binding.name, e))
            })?;

            if !seen.insert(binding.name.as_str()) {
                return Err(invalid(format!(
                    "queue '{}' is configured more than once",
                    binding.name
                )));
            }

            if let Some(polling) = &binding.polling {
                if polling.batch_size == Some(0) {
                    return Err(invalid(format!(
                        "queue '{}': polling.batch_size must be at least 1",
                        binding.name
                    )));
                }
                if polling.wait_time_seconds == Some(0) {
                    return Err(invalid(format!(
                        "queue '{}': polling.wait_time_seconds must be at least 1",
                        binding.name
                    )));
                }
            }
        }

        if self.polling.batch_size == 0 {
            return Err(invalid("polling.batch_size must be at least 1"));
        }
        if self.polling.wait_time_seconds == 0 {
            return Err(invalid("polling.wait_time_seconds must be at least 1"));
        }

        if self.backoff.base_delay_ms == 0 {
            return Err(invalid("backoff.base_delay_ms must be greater than 0"));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(invalid(
                "backoff.max_delay_ms must not be smaller than backoff.base_delay_ms",
            ));
        }
        if self.backoff.max_consecutive_failures == 0 {
            return Err(invalid(
                "backoff.max_consecutive_failures must be at least 1",
            ));
        }

        if self.reply.ttl_seconds == 0 {
            return Err(invalid("reply.ttl_seconds must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::Configuration {
        message: message.into(),
    }
}

/// Binds one queue or subject to a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    /// Queue, subject or stream name
    pub name: String,

    /// Durable consumer name for push backends
    #[serde(default)]
    pub durable_name: Option<String>,

    /// Per-queue overrides of the global polling settings
    #[serde(default)]
    pub polling: Option<PollingOverride>,
}

impl QueueBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable_name: None,
            polling: None,
        }
    }

    pub fn with_durable_name(mut self, durable_name: impl Into<String>) -> Self {
        self.durable_name = Some(durable_name.into());
        self
    }

    pub fn with_polling(mut self, polling: PollingOverride) -> Self {
        self.polling = Some(polling);
        self
    }

    /// Batch size after applying the per-queue override
    pub fn batch_size(&self, defaults: &PollingConfig) -> u32 {
        self.polling
            .as_ref()
            .and_then(|p| p.batch_size)
            .unwrap_or(defaults.batch_size)
    }

    /// Long-poll wait after applying the per-queue override
    pub fn wait_time(&self, defaults: &PollingConfig) -> Duration {
        let seconds = self
            .polling
            .as_ref()
            .and_then(|p| p.wait_time_seconds)
            .unwrap_or(defaults.wait_time_seconds);
        Duration::from_secs(seconds)
    }
}

/// Per-queue polling overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingOverride {
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub wait_time_seconds: Option<u64>,
}

/// Fetch settings for pull backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Maximum messages per fetch
    pub batch_size: u32,

    /// Long-poll wait per fetch
    pub wait_time_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait_time_seconds: 20,
        }
    }
}

/// Backoff after consecutive fetch failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Consecutive failures after which the polling loop stops
    pub max_consecutive_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_consecutive_failures: 5,
        }
    }
}

/// Graceful shutdown settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long stop waits for in-flight messages before releasing
    /// resources anyway; `None`, or a value past the clock's range, waits
    /// forever.
    pub drain_timeout_seconds: Option<u64>,
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_seconds.map(Duration::from_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_seconds: Some(30),
        }
    }
}

/// Reply delivery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Expiry of replies written to a key/value store
    pub ttl_seconds: u64,
}

impl ReplyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self { ttl_seconds: 300 }
    }
}

/// Handling of payloads that fail to decode as JSON
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Skip the handler; send an error reply and reject the message
    #[default]
    Reject,
    /// Hand the handler an empty JSON object instead
    EmptyObject,
}
