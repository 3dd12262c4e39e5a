//! String key/value store with expiring keys.
//!
//! Backends without native request-reply deliver replies by writing them
//! under the caller-chosen key; callers poll the key until it appears or
//! expires.

use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

const STORE_NAME: &str = "InMemoryKeyValueStore";

/// Minimal string store used as a reply channel
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Write `value` under `key`, replacing any previous value; the key
    /// disappears after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration)
        -> Result<(), QueueError>;

    /// Read `key`; expired or missing keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<(), QueueError>;

    /// Release the store client. Calling it again is a no-op.
    async fn close(&self) -> Result<(), QueueError>;
}

struct Entry {
    value: String,
    /// `None` when the lifetime is too long to represent
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, Entry>,
    closed: bool,
}

/// Process-local [`KeyValueStore`]
#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .map(|s| s.entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of `key`, if it is live
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state.lock().ok()?;
        state
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at.map_or(Duration::MAX, |at| at - now))
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    fn open_state(&self) -> Result<MutexGuard<'_, StoreState>, QueueError> {
        let state = self.state.lock().map_err(|_| QueueError::ProviderError {
            provider: STORE_NAME.to_string(),
            code: "LockPoisoned".to_string(),
            message: "store lock poisoned".to_string(),
        })?;

        if state.closed {
            return Err(QueueError::ConnectionClosed {
                provider: STORE_NAME.to_string(),
            });
        }
        Ok(state)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn set_with_expiry(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.open_state()?;
        let now = Instant::now();

        // Opportunistic sweep keeps abandoned reply keys from piling up
        state.entries.retain(|_, entry| entry.is_live(now));
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut state = self.open_state()?;
        let now = Instant::now();

        match state.entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.open_state().map(|_| ())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        Ok(())
    }
}
