//! # Queue App
//!
//! Turns a connected queue backend into a consumer application: a set of
//! consumers, each wrapping a user handler with the standard processing
//! pipeline (decode, correlate, invoke, reply, acknowledge), plus a
//! coordinated run/stop lifecycle that drains in-flight work before
//! releasing backend resources.
//!
//! ## Module Organization
//!
//! - [config] - Application configuration and validation
//! - [error] - Application and handler error types
//! - [reply] - Reply envelopes and reply transports
//! - [correlation] - Correlation id and reply destination resolution
//! - [handler] - The handler contract and per-message context
//! - [state] - Per-consumer shutdown flags and in-flight accounting
//! - [backoff] - Exponential backoff for failed fetches
//! - [app] - Application builder and run/stop orchestration
//!
//! ## Example
//!
//! ```rust,no_run
//! use queue_app::{AppBuilder, AppConfig, HandlerError, MessageContext, QueueBinding};
//! use queue_runtime::{Backend, InMemoryQueueProvider, QueueName};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(InMemoryQueueProvider::default());
//! provider.create_queue(&QueueName::new("orders".to_string())?)?;
//!
//! let mut config = AppConfig::default();
//! config.queues.push(QueueBinding::new("orders"));
//!
//! let app = AppBuilder::new(config, ())
//!     .backend(Backend::pull(provider))
//!     .handler("orders", |content: Value, _ctx: MessageContext<()>| async move {
//!         Ok::<_, HandlerError>(json!({ "received": content }))
//!     })
//!     .build()
//!     .await?;
//!
//! let handle = app.start().await?;
//! // ... later
//! let report = app.stop().await;
//! assert!(report.drained);
//! handle.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod backoff;
pub mod config;
mod consumer;
pub mod correlation;
pub mod error;
pub mod handler;
mod pipeline;
mod polling;
pub mod reply;
pub mod state;

pub use app::{App, AppBuilder, RunHandle, ShutdownReport};
pub use backoff::Backoff;
pub use config::{
    AppConfig, BackoffConfig, DecodePolicy, PollingConfig, PollingOverride, QueueBinding,
    ReplyConfig, ShutdownConfig,
};
pub use correlation::Correlation;
pub use error::{AppError, ErrorKind, HandlerError};
pub use handler::{MessageContext, MessageHandler};
pub use reply::{BrokerReplyTransport, Reply, ReplyError, ReplyTransport, StoreReplyTransport};
pub use state::{ConsumerState, InFlightCounter, InFlightGuard};
