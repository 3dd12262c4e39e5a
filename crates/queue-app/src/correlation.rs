//! Correlation id and reply destination resolution.
//!
//! The native metadata fields of the message win; attribute keys are the
//! fallback for backends that only carry string headers. Empty values count
//! as absent.

use queue_runtime::{ReceivedMessage, CORRELATION_ID_ATTRIBUTES, REPLY_TO_ATTRIBUTES};

#[cfg(test)]
#[path = "correlation_tests.rs"]
mod tests;

/// Correlation metadata of one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub correlation_id: String,
    pub reply_to: Option<String>,
    /// `true` when no id was present and a fresh one was minted
    pub generated: bool,
}

impl Correlation {
    /// Resolve correlation metadata for `message`. Never fails.
    pub fn resolve(message: &ReceivedMessage) -> Self {
        let existing = non_empty(message.correlation_id.as_deref())
            .or_else(|| message.attribute(&CORRELATION_ID_ATTRIBUTES));

        let (correlation_id, generated) = match existing {
            Some(id) => (id.to_string(), false),
            None => (uuid::Uuid::new_v4().to_string(), true),
        };

        let reply_to = non_empty(message.reply_to.as_deref())
            .or_else(|| message.attribute(&REPLY_TO_ATTRIBUTES))
            .map(str::to_string);

        Self {
            correlation_id,
            reply_to,
            generated,
        }
    }

    pub fn wants_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
