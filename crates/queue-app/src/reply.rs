//! Reply envelopes and the transports that deliver them.
//!
//! A reply is either a success carrying the handler's return value or an
//! error carrying the failure message. Both forms carry the correlation id of
//! the request and the emission time:
//!
//! ```json
//! {"status":"success","data":{"ok":true},"correlationId":"c-1","timestamp":"2026-10-18T09:30:00.125Z"}
//! {"status":"error","error":{"message":"boom","details":{"kind":"handler"}},"correlationId":"c-1","timestamp":"2026-10-18T09:30:00.125Z"}
//! ```

use crate::error::{AppError, HandlerError};
use async_trait::async_trait;
use queue_runtime::{Backend, KeyValueStore, Message, QueueName, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
#[path = "reply_tests.rs"]
mod tests;

/// Default lifetime of replies written to a key/value store
pub const DEFAULT_REPLY_TTL: Duration = Duration::from_secs(300);

// ============================================================================
// Envelope
// ============================================================================

/// Reply envelope sent to the requester's reply destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Success {
        data: Value,
        #[serde(rename = "correlationId")]
        correlation_id: String,
        timestamp: String,
    },
    Error {
        error: ReplyError,
        #[serde(rename = "correlationId")]
        correlation_id: String,
        timestamp: String,
    },
}

/// Error body of an error reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl Reply {
    /// Success reply stamped with the current time
    pub fn success(correlation_id: impl Into<String>, data: Value) -> Self {
        Self::Success {
            data,
            correlation_id: correlation_id.into(),
            timestamp: Timestamp::now().to_rfc3339_millis(),
        }
    }

    /// Error reply stamped with the current time
    ///
    /// The error kind is always included in `details` next to any structured
    /// details the failure carried. A blank message is replaced with one
    /// naming the kind.
    pub fn error(correlation_id: impl Into<String>, failure: &HandlerError) -> Self {
        let kind = failure.kind.as_str();
        let mut details = failure.details.clone().unwrap_or_default();
        details.insert("kind".to_string(), Value::String(kind.to_string()));

        let message = if failure.message.trim().is_empty() {
            format!("{} failure", kind)
        } else {
            failure.message.clone()
        };

        Self::Error {
            error: ReplyError {
                message,
                details: Some(details),
            },
            correlation_id: correlation_id.into(),
            timestamp: Timestamp::now().to_rfc3339_millis(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Success { correlation_id, .. } | Self::Error { correlation_id, .. } => {
                correlation_id
            }
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            Self::Success { timestamp, .. } | Self::Error { timestamp, .. } => timestamp,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Encode the envelope as JSON
    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Transports
// ============================================================================

/// Delivers reply envelopes to a reply destination
#[async_trait]
pub trait ReplyTransport: Send + Sync {
    /// Deliver `reply` to `reply_to`.
    ///
    /// Encoding failures are reported as [`AppError::Serialization`];
    /// delivery failures as [`AppError::Reply`].
    async fn send_reply(&self, reply_to: &str, reply: &Reply) -> Result<(), AppError>;

    /// Check that the destination side is reachable
    async fn verify(&self) -> Result<(), AppError>;

    /// Release transport resources. Calling it again is a no-op.
    async fn close(&self) -> Result<(), AppError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Publishes replies on the same backend the request arrived on
///
/// The reply destination names a queue or subject. The correlation id is
/// attached both as the native correlation field and as a `correlation-id`
/// attribute.
pub struct BrokerReplyTransport {
    backend: Backend,
}

impl BrokerReplyTransport {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ReplyTransport for BrokerReplyTransport {
    async fn send_reply(&self, reply_to: &str, reply: &Reply) -> Result<(), AppError> {
        let body = reply.to_json()?;
        let destination =
            QueueName::new(reply_to.to_string()).map_err(|e| AppError::Reply {
                reply_to: reply_to.to_string(),
                message: e.to_string(),
            })?;

        let message = Message::new(body.into())
            .with_correlation_id(reply.correlation_id().to_string())
            .with_attribute(
                "correlation-id".to_string(),
                reply.correlation_id().to_string(),
            );

        self.backend
            .send_message(&destination, message)
            .await
            .map(|_| ())
            .map_err(|e| AppError::Reply {
                reply_to: reply_to.to_string(),
                message: e.to_string(),
            })
    }

    async fn verify(&self) -> Result<(), AppError> {
        // Reply destinations are chosen per request; the backend connection
        // itself is verified through the consumer queues.
        Ok(())
    }

    async fn close(&self) -> Result<(), AppError> {
        // The backend is shared with the consumers and closed by the app.
        Ok(())
    }

    fn name(&self) -> &'static str {
        "broker"
    }
}

/// Writes replies into a key/value store under the reply destination key
pub struct StoreReplyTransport {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl StoreReplyTransport {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_REPLY_TTL,
        }
    }

    /// Override how long replies stay readable
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl ReplyTransport for StoreReplyTransport {
    async fn send_reply(&self, reply_to: &str, reply: &Reply) -> Result<(), AppError> {
        let body = reply.to_json()?;
        self.store
            .set_with_expiry(reply_to, body, self.ttl)
            .await
            .map_err(|e| AppError::Reply {
                reply_to: reply_to.to_string(),
                message: e.to_string(),
            })
    }

    async fn verify(&self) -> Result<(), AppError> {
        self.store.ping().await.map_err(|e| AppError::Connection {
            target: "reply store".to_string(),
            message: e.to_string(),
        })
    }

    async fn close(&self) -> Result<(), AppError> {
        self.store.close().await.map_err(AppError::from)
    }

    fn name(&self) -> &'static str {
        "store"
    }
}
