//! Error types for the consumer application.

use queue_runtime::QueueError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

/// Application-level errors raised while building, running or stopping
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("No handler registered for queue '{queue}'")]
    MissingHandler { queue: String },

    /// A backend or store could not be reached at startup
    #[error("Connection check failed for {target}: {message}")]
    Connection { target: String, message: String },

    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// The fetch loop hit its consecutive-failure ceiling
    #[error("Polling stopped for '{queue}' after {failures} consecutive failures: {last_error}")]
    PollingFailed {
        queue: String,
        failures: u32,
        last_error: String,
    },

    #[error("Application has already been started")]
    AlreadyStarted,

    #[error("Failed to deliver reply to '{reply_to}': {message}")]
    Reply { reply_to: String, message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A receive loop task ended abnormally
    #[error("Receive task failed: {message}")]
    TaskFailed { message: String },
}

impl AppError {
    /// Check if the error prevents the application from starting
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::MissingHandler { .. } | Self::Connection { .. }
        )
    }
}

/// Category of a handler-path failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The payload could not be decoded
    Decode,
    /// The handler returned an error
    Handler,
    /// The handler panicked
    Panic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Handler => "handler",
            Self::Panic => "panic",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure produced on the handler path of the pipeline
///
/// Carries a kind, a human-readable message and an optional structured
/// detail map. All three are preserved in the error reply envelope.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Map<String, Value>>,
}

impl HandlerError {
    /// Create a handler failure with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Handler,
            message: message.into(),
            details: None,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Decode,
            message: message.into(),
            details: None,
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Panic,
            message: message.into(),
            details: None,
        }
    }

    /// Attach one structured detail
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err.to_string())
            .with_detail("line", err.line())
            .with_detail("column", err.column())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        let causes: Vec<Value> = err
            .chain()
            .skip(1)
            .map(|cause| Value::String(cause.to_string()))
            .collect();

        let error = Self::new(err.to_string());
        if causes.is_empty() {
            error
        } else {
            error.with_detail("causes", causes)
        }
    }
}
