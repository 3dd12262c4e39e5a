//! Application builder and run/stop orchestration.
//!
//! [`App`] owns the backend connection, the reply transport and one consumer
//! per configured queue. It is the only component that sees all consumers.
//!
//! Stop sequence (runs once; later callers receive the same report):
//! 1. every consumer enters shutdown and its blocked fetch is cancelled
//! 2. receive loops exit and push subscriptions are closed
//! 3. wait for in-flight messages to drain, bounded by the drain timeout
//! 4. release the reply transport, then the shared backend connection
//!
//! Every release step is attempted even when an earlier one fails.

use crate::backoff::Backoff;
use crate::config::AppConfig;
use crate::consumer::Consumer;
use crate::error::AppError;
use crate::handler::MessageHandler;
use crate::pipeline::Pipeline;
use crate::polling::PollSettings;
use crate::reply::{BrokerReplyTransport, ReplyTransport};
use queue_runtime::{Backend, QueueName};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[cfg(test)]
#[path = "app_tests.rs"]
mod tests;

// ============================================================================
// Builder
// ============================================================================

/// Assembles an [`App`] from configuration, a backend and handlers
pub struct AppBuilder<C> {
    config: AppConfig,
    context: Arc<C>,
    backend: Option<Backend>,
    replies: Option<Arc<dyn ReplyTransport>>,
    handlers: HashMap<String, Arc<dyn MessageHandler<C>>>,
}

impl<C> AppBuilder<C>
where
    C: Send + Sync + 'static,
{
    /// Start a builder with the application context handed to every handler
    pub fn new(config: AppConfig, context: C) -> Self {
        Self::with_shared_context(config, Arc::new(context))
    }

    /// Start a builder with an already shared application context
    pub fn with_shared_context(config: AppConfig, context: Arc<C>) -> Self {
        Self {
            config,
            context,
            backend: None,
            replies: None,
            handlers: HashMap::new(),
        }
    }

    /// Connected backend every consumer uses
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Where replies go. Defaults to publishing on the backend itself.
    pub fn reply_transport(mut self, replies: Arc<dyn ReplyTransport>) -> Self {
        self.replies = Some(replies);
        self
    }

    /// Register the handler for one configured queue
    pub fn handler<H>(mut self, queue: impl Into<String>, handler: H) -> Self
    where
        H: MessageHandler<C> + 'static,
    {
        self.handlers.insert(queue.into(), Arc::new(handler));
        self
    }

    /// Validate, verify connectivity and create the consumers.
    ///
    /// Any failure here is fatal: the application never starts.
    pub async fn build(mut self) -> Result<App<C>, AppError> {
        self.config.validate()?;

        let backend = self.backend.take().ok_or_else(|| AppError::Configuration {
            message: "no backend configured".to_string(),
        })?;
        let replies = self
            .replies
            .take()
            .unwrap_or_else(|| Arc::new(BrokerReplyTransport::new(backend.clone())));

        for queue in self.handlers.keys() {
            if !self.config.queues.iter().any(|b| &b.name == queue) {
                return Err(AppError::Configuration {
                    message: format!("handler registered for unconfigured queue '{}'", queue),
                });
            }
        }

        let backoff = Backoff::from_config(&self.config.backoff);
        let mut consumers = Vec::with_capacity(self.config.queues.len());

        for binding in &self.config.queues {
            let queue =
                QueueName::new(binding.name.clone()).map_err(|e| AppError::Configuration {
                    message: e.to_string(),
                })?;
            let handler =
                self.handlers
                    .remove(&binding.name)
                    .ok_or_else(|| AppError::MissingHandler {
                        queue: binding.name.clone(),
                    })?;

            backend
                .verify_queue(&queue)
                .await
                .map_err(|e| AppError::Connection {
                    target: binding.name.clone(),
                    message: e.to_string(),
                })?;

            let pipeline = Pipeline::new(
                queue,
                handler,
                backend.clone(),
                Arc::clone(&replies),
                Arc::clone(&self.context),
                self.config.decode_policy,
            );
            let poll = PollSettings {
                batch_size: binding.batch_size(&self.config.polling),
                wait: binding.wait_time(&self.config.polling),
                backoff,
            };
            consumers.push(Arc::new(Consumer::new(binding.clone(), pipeline, poll)));
        }

        replies.verify().await?;

        info!(
            consumers = consumers.len(),
            provider = %backend.provider_type(),
            replies = replies.name(),
            "Application built"
        );

        Ok(App {
            inner: Arc::new(AppInner {
                consumers,
                backend,
                replies,
                drain_timeout: self.config.shutdown.drain_timeout(),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                report: OnceCell::new(),
            }),
        })
    }
}

// ============================================================================
// App
// ============================================================================

/// Outcome of a stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// All in-flight messages finished before resources were released
    pub drained: bool,
    /// Messages still in flight when the drain timeout forced the release
    pub abandoned_in_flight: usize,
    /// Release steps that failed; shutdown continued past each of them
    pub release_errors: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.drained && self.release_errors.is_empty()
    }
}

struct AppInner<C> {
    consumers: Vec<Arc<Consumer<C>>>,
    backend: Backend,
    replies: Arc<dyn ReplyTransport>,
    drain_timeout: Option<Duration>,
    started: AtomicBool,
    stopping: AtomicBool,
    /// Held by `start` for its whole run so shutdown never interleaves with it
    lifecycle: Mutex<()>,
    report: OnceCell<ShutdownReport>,
}

/// A built consumer application
///
/// Cloning is cheap and every clone controls the same application, so one
/// clone can `run` while another calls `stop`.
pub struct App<C> {
    inner: Arc<AppInner<C>>,
}

impl<C> Clone for App<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> App<C>
where
    C: Send + Sync + 'static,
{
    /// Begin consuming.
    ///
    /// Push subscriptions are established before this returns; message
    /// delivery then runs in the background. Calling it after `stop` starts
    /// nothing.
    pub async fn start(&self) -> Result<RunHandle, AppError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::AlreadyStarted);
        }
        let _lifecycle = self.inner.lifecycle.lock().await;

        let mut tasks = JoinSet::new();
        if self.inner.stopping.load(Ordering::SeqCst) {
            info!("Application is stopping; not starting consumers");
            return Ok(RunHandle { tasks });
        }

        for consumer in &self.inner.consumers {
            consumer.subscribe(&self.inner.backend).await?;

            if self.inner.stopping.load(Ordering::SeqCst) {
                info!("Stop requested while subscribing; not starting consumers");
                return Ok(RunHandle { tasks });
            }
        }

        for consumer in &self.inner.consumers {
            let name = consumer.name().to_string();
            let handle = consumer.spawn_receive(&self.inner.backend);
            tasks.spawn(async move {
                match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(AppError::TaskFailed {
                        message: format!("consumer '{}': {}", name, e),
                    }),
                }
            });
        }

        info!(
            consumers = self.inner.consumers.len(),
            mode = ?self.inner.backend.delivery_mode(),
            "Application started"
        );
        Ok(RunHandle { tasks })
    }

    /// `start` followed by waiting for every receive loop to exit
    pub async fn run(&self) -> Result<(), AppError> {
        self.start().await?.wait().await
    }

    /// Gracefully stop. Safe to call repeatedly and concurrently; the
    /// shutdown sequence runs once and every caller gets its report.
    pub async fn stop(&self) -> ShutdownReport {
        self.inner
            .report
            .get_or_init(|| self.shutdown())
            .await
            .clone()
    }

    /// Sum of in-flight messages across all consumers
    pub fn in_flight(&self) -> usize {
        self.inner
            .consumers
            .iter()
            .map(|c| c.state().in_flight())
            .sum()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Names of the configured consumers
    pub fn queues(&self) -> Vec<String> {
        self.inner
            .consumers
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    async fn shutdown(&self) -> ShutdownReport {
        info!(in_flight = self.in_flight(), "Stopping application");
        self.inner.stopping.store(true, Ordering::SeqCst);

        for consumer in &self.inner.consumers {
            consumer.state().begin_shutdown();
        }

        // A start in progress finishes first; its subscriptions are then
        // closed below like any other.
        let _lifecycle = self.inner.lifecycle.lock().await;

        let deadline = self
            .inner
            .drain_timeout
            .and_then(|timeout| tokio::time::Instant::now().checked_add(timeout));
        let mut release_errors = Vec::new();

        // Receive loops notice the cancellation promptly; once they are gone
        // no new admission or release can be dispatched.
        let loops_stopped = within(deadline, async {
            for consumer in &self.inner.consumers {
                consumer.state().wait_receive_stopped().await;
            }
        })
        .await;

        if loops_stopped {
            for consumer in &self.inner.consumers {
                if let Err(e) = consumer.close_subscription().await {
                    warn!(queue = consumer.name(), error = %e, "Failed to close subscription");
                    release_errors.push(format!("subscription '{}': {}", consumer.name(), e));
                }
            }
        } else {
            warn!("Receive loops did not stop before the drain timeout");
            release_errors.push("receive loops did not stop before the drain timeout".to_string());
        }

        let drained = within(deadline, async {
            for consumer in &self.inner.consumers {
                consumer.state().wait_drained().await;
            }
        })
        .await;

        let abandoned_in_flight = self.in_flight();
        if drained {
            info!("All in-flight messages drained");
        } else {
            error!(
                in_flight = abandoned_in_flight,
                "Drain timeout elapsed; releasing resources with messages still in flight"
            );
        }

        if let Err(e) = self.inner.replies.close().await {
            warn!(error = %e, "Failed to close reply transport");
            release_errors.push(format!("reply transport: {}", e));
        }

        if let Err(e) = self.inner.backend.close().await {
            warn!(error = %e, "Failed to close backend");
            release_errors.push(format!("backend: {}", e));
        }

        let report = ShutdownReport {
            drained,
            abandoned_in_flight,
            release_errors,
        };
        info!(
            drained = report.drained,
            release_errors = report.release_errors.len(),
            "Application stopped"
        );
        report
    }
}

/// Run `work` to completion, or until `deadline` if one is set.
/// Returns whether the work completed.
async fn within<F>(deadline: Option<tokio::time::Instant>, work: F) -> bool
where
    F: std::future::Future<Output = ()>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, work).await.is_ok(),
        None => {
            work.await;
            true
        }
    }
}

// ============================================================================
// RunHandle
// ============================================================================

/// Tracks the receive loops started by [`App::start`]
pub struct RunHandle {
    tasks: JoinSet<Result<(), AppError>>,
}

impl RunHandle {
    /// Wait until every receive loop has exited.
    ///
    /// Returns the first fatal loop error, if any; the other loops keep
    /// running until stopped.
    pub async fn wait(mut self) -> Result<(), AppError> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(AppError::TaskFailed {
                    message: e.to_string(),
                })
            });

            if let Err(e) = result {
                error!(error = %e, "Consumer loop failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of receive loops still running
    pub fn running(&self) -> usize {
        self.tasks.len()
    }
}
