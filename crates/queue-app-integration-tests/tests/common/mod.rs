//! Common test utilities for queue-app integration tests
//!
//! This module provides:
//! - A scripted handler that records every invocation
//! - Harnesses wiring an application to the in-memory pull queue or push broker
//! - Polling helpers for asynchronous assertions

use async_trait::async_trait;
use queue_app::{
    App, AppBuilder, AppConfig, HandlerError, MessageContext, MessageHandler, QueueBinding,
    Reply, RunHandle, StoreReplyTransport,
};
use queue_runtime::{
    Backend, InMemoryBroker, InMemoryKeyValueStore, InMemoryQueueProvider, KeyValueStore,
    Message, QueueName, QueueProvider,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Scripted Handler
// ============================================================================

/// One observed handler invocation
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Invocation {
    pub queue: String,
    pub content: Value,
    pub correlation_id: String,
    pub reply_to: Option<String>,
    pub delivery_count: u32,
}

/// Application context recording what the handler saw
#[derive(Default)]
pub struct Recorder {
    invocations: Mutex<Vec<Invocation>>,
    finished: AtomicUsize,
}

#[allow(dead_code)]
impl Recorder {
    pub fn calls(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }
}

/// Behaves according to the payload:
/// - `"action": "process"` answers `{"success": true}`
/// - `"action": "fail"` fails with `boom`
/// - `"sleep_ms": n` delays the answer
/// - anything else is echoed back
pub struct ScenarioHandler;

#[async_trait]
impl MessageHandler<Recorder> for ScenarioHandler {
    async fn handle(
        &self,
        content: Value,
        ctx: MessageContext<Recorder>,
    ) -> Result<Value, HandlerError> {
        ctx.app().invocations.lock().unwrap().push(Invocation {
            queue: ctx.queue().to_string(),
            content: content.clone(),
            correlation_id: ctx.correlation_id().to_string(),
            reply_to: ctx.reply_to().map(str::to_string),
            delivery_count: ctx.delivery_count(),
        });

        if let Some(ms) = content["sleep_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        ctx.app().finished.fetch_add(1, Ordering::SeqCst);

        match content["action"].as_str() {
            Some("process") => Ok(json!({"success": true})),
            Some("fail") => Err(HandlerError::new("boom")),
            _ => Ok(json!({"echo": content})),
        }
    }
}

// ============================================================================
// Harnesses
// ============================================================================

pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).expect("valid queue name")
}

/// Configuration with short long-polls so idle tests stay fast
pub fn config_for(queues: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    for name in queues {
        config = config.with_queue(QueueBinding::new(*name));
    }
    config.polling.wait_time_seconds = 1;
    config
}

/// Application over the in-memory pull queue with a key/value reply store
#[allow(dead_code)]
pub struct PullHarness {
    pub provider: Arc<InMemoryQueueProvider>,
    pub store: InMemoryKeyValueStore,
    pub recorder: Arc<Recorder>,
    pub app: App<Recorder>,
}

#[allow(dead_code)]
impl PullHarness {
    pub async fn new(queues: &[&str]) -> Self {
        Self::with_config(config_for(queues)).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let provider = Arc::new(InMemoryQueueProvider::default());
        for binding in &config.queues {
            provider.create_queue(&queue(&binding.name)).unwrap();
        }
        let store = InMemoryKeyValueStore::new();
        let recorder = Arc::new(Recorder::default());

        let mut builder = AppBuilder::with_shared_context(config.clone(), Arc::clone(&recorder))
            .backend(Backend::pull(Arc::clone(&provider)))
            .reply_transport(Arc::new(StoreReplyTransport::new(Arc::new(store.clone()))));
        for binding in &config.queues {
            builder = builder.handler(binding.name.clone(), ScenarioHandler);
        }
        let app = builder.build().await.expect("application should build");

        Self {
            provider,
            store,
            recorder,
            app,
        }
    }

    pub async fn start(&self) -> RunHandle {
        self.app.start().await.expect("application should start")
    }

    pub async fn send(&self, name: &str, message: Message) {
        self.provider
            .send_message(&queue(name), message)
            .await
            .expect("send should succeed");
    }

    /// Wait for a reply and decode it while the store is still open
    pub async fn reply(&self, key: &str) -> Reply {
        let raw = eventually_some(&format!("reply '{}'", key), || async {
            self.store.get(key).await.ok().flatten()
        })
        .await;
        serde_json::from_str(&raw).expect("reply should be a valid envelope")
    }
}

/// Application over the in-memory push broker replying through the broker
#[allow(dead_code)]
pub struct PushHarness {
    pub broker: Arc<InMemoryBroker>,
    pub recorder: Arc<Recorder>,
    pub app: App<Recorder>,
}

#[allow(dead_code)]
impl PushHarness {
    pub async fn new(subjects: &[&str]) -> Self {
        let broker = Arc::new(InMemoryBroker::default());
        let recorder = Arc::new(Recorder::default());

        let mut builder =
            AppBuilder::with_shared_context(config_for(subjects), Arc::clone(&recorder))
                .backend(Backend::push(Arc::clone(&broker)));
        for subject in subjects {
            builder = builder.handler(*subject, ScenarioHandler);
        }
        let app = builder.build().await.expect("application should build");

        Self {
            broker,
            recorder,
            app,
        }
    }

    pub async fn start(&self) -> RunHandle {
        self.app.start().await.expect("application should start")
    }

    pub async fn publish(&self, subject: &str, message: Message) {
        self.broker
            .send_message(&queue(subject), message)
            .await
            .expect("publish should succeed");
    }
}

// ============================================================================
// Async Assertions
// ============================================================================

/// Poll `condition` until it holds, failing the test after two seconds
#[allow(dead_code)]
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

/// Poll `probe` until it yields a value, failing the test after two seconds
#[allow(dead_code)]
pub async fn eventually_some<T, F, Fut>(what: &str, probe: F) -> T
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(value) = probe().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

/// Assert the timestamp is RFC 3339 UTC with millisecond precision
#[allow(dead_code)]
pub fn assert_reply_timestamp(timestamp: &str) {
    let parsed = chrono::DateTime::parse_from_rfc3339(timestamp)
        .unwrap_or_else(|e| panic!("timestamp '{}' is not RFC 3339: {}", timestamp, e));
    assert_eq!(parsed.offset().local_minus_utc(), 0);
    assert!(timestamp.ends_with('Z'), "timestamp '{}' must end in Z", timestamp);
    assert_eq!(timestamp.len(), "2024-01-01T00:00:00.000Z".len());
}
