//! # Queue App Service
//!
//! Process bootstrap for running queue-app consumers:
//! - Parses command-line arguments
//! - Loads [`AppConfig`] from files and environment
//! - Initializes the tracing subscriber
//! - Wires an in-memory backend, reply store and echo handlers
//! - Runs until a shutdown signal, then stops gracefully

use anyhow::Context;
use clap::{Parser, ValueEnum};
use queue_app::{
    App, AppBuilder, AppConfig, AppError, HandlerError, MessageContext, ShutdownReport,
    StoreReplyTransport,
};
use queue_runtime::{
    Backend, InMemoryBroker, InMemoryKeyValueStore, InMemoryQueueProvider, Message, QueueName,
};
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Configuration file looked up relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config/queue-app";

/// Prefix of configuration environment variables, e.g.
/// `QUEUE_APP__POLLING__BATCH_SIZE=5`
pub const ENV_PREFIX: &str = "QUEUE_APP";

const DEFAULT_LOG_FILTER: &str = "queue_app=info,queue_app_service=info,queue_runtime=info";

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue App Service - consume queues with request/reply handlers
#[derive(Debug, Parser)]
#[command(name = "queue-app-service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run queue consumers with graceful shutdown")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_APP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level; overridden by RUST_LOG
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Delivery mode of the in-memory backend
    #[arg(short, long, value_enum, default_value_t = Mode::Pull)]
    pub mode: Mode,

    /// JSON payload published to every configured queue at startup
    #[arg(long)]
    pub seed: Option<String>,
}

/// Which in-memory backend the service wires
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Polling queue with visibility timeouts
    Pull,
    /// Subscription broker with ack/nak/term
    Push,
}

// ============================================================================
// Errors
// ============================================================================

/// Service-level errors with their process exit codes
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid seed payload: {0}")]
    InvalidSeed(#[from] serde_json::Error),

    #[error("Startup failed: {0}")]
    Startup(#[source] AppError),

    #[error("Consumer failed: {0}")]
    Runtime(#[source] AppError),

    #[error("Logging initialization failed: {0}")]
    Logging(String),
}

impl ServiceError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Startup(_) => 1,
            Self::Runtime(_) => 2,
            Self::Configuration { .. } | Self::InvalidSeed(_) => 3,
            Self::Logging(_) => 4,
        }
    }
}

impl From<config::ConfigError> for ServiceError {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration {
            message: e.to_string(),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Load and validate the application configuration.
///
/// Sources, later ones overriding earlier ones:
/// 1. `config/queue-app.{yaml,toml,json}` if present
/// 2. the explicit file, which must exist
/// 3. `QUEUE_APP__*` environment variables (double-underscore separator)
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig, ServiceError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false));

    if let Some(path) = explicit {
        info!(path = %path.display(), "Loading configuration from explicit path");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let app_config: AppConfig = builder
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize()?;

    app_config.validate().map_err(|e| ServiceError::Configuration {
        message: e.to_string(),
    })?;

    Ok(app_config)
}

// ============================================================================
// Logging
// ============================================================================

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `--log-level`; without either the service logs
/// its own crates at info.
pub fn init_tracing(cli: &Cli) -> Result<(), ServiceError> {
    let filter = log_filter(cli.log_level.as_deref());
    let registry = tracing_subscriber::registry().with(filter);

    let result = if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| ServiceError::Logging(e.to_string()))
}

fn log_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| match level {
        Some(level) => EnvFilter::new(format!(
            "queue_app={0},queue_app_service={0},queue_runtime={0}",
            level
        )),
        None => EnvFilter::new(DEFAULT_LOG_FILTER),
    })
}

// ============================================================================
// Handler
// ============================================================================

/// Application context shared by the echo handlers
#[derive(Debug)]
pub struct EchoContext {
    pub mode: Mode,
    handled: AtomicU64,
}

impl EchoContext {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            handled: AtomicU64::new(0),
        }
    }

    /// Messages the echo handlers completed successfully
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }
}

/// Replies with the received payload.
///
/// A payload carrying an `"error"` string fails with that message, which
/// makes the error reply path observable from outside.
pub async fn echo_handler(
    content: Value,
    ctx: MessageContext<EchoContext>,
) -> Result<Value, HandlerError> {
    if let Some(message) = content.get("error").and_then(Value::as_str) {
        let failure = anyhow::anyhow!(message.to_string())
            .context(format!("echo on '{}' rejected the payload", ctx.queue()));
        return Err(failure.into());
    }

    ctx.app().handled.fetch_add(1, Ordering::SeqCst);
    info!(queue = %ctx.queue(), "Echoing message");

    Ok(json!({
        "echo": content,
        "queue": ctx.queue().as_str(),
        "deliveryCount": ctx.delivery_count(),
        "handledAt": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    }))
}

// ============================================================================
// Service
// ============================================================================

/// A built service: the application plus the in-memory resources it runs on
pub struct Service {
    app: App<EchoContext>,
    backend: Backend,
    store: InMemoryKeyValueStore,
    context: Arc<EchoContext>,
    queues: Vec<QueueName>,
}

impl Service {
    /// Wire the in-memory backend of `mode` with an echo handler per queue
    pub async fn build(config: AppConfig, mode: Mode) -> Result<Self, ServiceError> {
        let queues = config
            .queues
            .iter()
            .map(|b| QueueName::new(b.name.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServiceError::Configuration {
                message: e.to_string(),
            })?;

        let backend = match mode {
            Mode::Pull => {
                let provider = Arc::new(InMemoryQueueProvider::default());
                for queue in &queues {
                    provider
                        .create_queue(queue)
                        .map_err(|e| ServiceError::Startup(e.into()))?;
                }
                Backend::pull(provider)
            }
            Mode::Push => Backend::push(Arc::new(InMemoryBroker::default())),
        };

        let store = InMemoryKeyValueStore::new();
        let replies =
            StoreReplyTransport::new(Arc::new(store.clone())).with_ttl(config.reply.ttl());
        let context = Arc::new(EchoContext::new(mode));

        let mut builder = AppBuilder::with_shared_context(config, Arc::clone(&context))
            .backend(backend.clone())
            .reply_transport(Arc::new(replies));
        for queue in &queues {
            builder = builder.handler(queue.as_str(), echo_handler);
        }
        let app = builder.build().await.map_err(ServiceError::Startup)?;

        info!(mode = ?mode, queues = queues.len(), "Service built");
        Ok(Self {
            app,
            backend,
            store,
            context,
            queues,
        })
    }

    pub fn app(&self) -> &App<EchoContext> {
        &self.app
    }

    /// Reply store the echo handlers answer into
    pub fn store(&self) -> &InMemoryKeyValueStore {
        &self.store
    }

    pub fn context(&self) -> &Arc<EchoContext> {
        &self.context
    }

    /// Publish `payload` to every configured queue.
    ///
    /// Each seed asks for a reply under `seed:<queue>`.
    pub async fn seed(&self, payload: &Value) -> Result<usize, ServiceError> {
        let body = serde_json::to_vec(payload)?;

        for queue in &self.queues {
            let message = Message::new(body.clone().into())
                .with_reply_to(format!("seed:{}", queue))
                .with_correlation_id(format!("seed-{}", queue));
            self.backend
                .send_message(queue, message)
                .await
                .map_err(|e| ServiceError::Startup(e.into()))?;
        }

        info!(queues = self.queues.len(), "Seed published");
        Ok(self.queues.len())
    }

    /// Start consuming and run until `shutdown` resolves or a consumer
    /// fails; either way the application is stopped before returning.
    pub async fn run_until<F>(self, shutdown: F) -> Result<ShutdownReport, ServiceError>
    where
        F: Future<Output = ()>,
    {
        let handle = self.app.start().await.map_err(ServiceError::Startup)?;
        info!(
            running = handle.running(),
            queues = ?self.app.queues(),
            "Consumers running"
        );
        let loops = handle.wait();
        tokio::pin!(loops);
        tokio::pin!(shutdown);

        let finished = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                None
            }
            result = &mut loops => Some(result),
        };

        let report = self.app.stop().await;
        if report.drained {
            info!(release_errors = report.release_errors.len(), "Service stopped");
        } else {
            warn!(
                abandoned_in_flight = report.abandoned_in_flight,
                "Service stopped before all messages drained"
            );
        }

        let result = match finished {
            Some(result) => result,
            None => loops.await,
        };
        match result {
            Ok(()) => Ok(report),
            Err(e) => {
                error!(error = %e, "Consumer failed");
                Err(ServiceError::Runtime(e))
            }
        }
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Service entry point after argument parsing and logging setup
pub async fn run(cli: Cli) -> Result<(), ServiceError> {
    let config = load_config(cli.config.as_deref())?;
    info!(queues = config.queues.len(), mode = ?cli.mode, "Configuration loaded");

    let seed = cli
        .seed
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()?;

    let service = Service::build(config, cli.mode).await?;
    if let Some(payload) = &seed {
        service.seed(payload).await?;
    }

    service.run_until(shutdown_signal()).await.map(|_| ())
}

/// Parse arguments, initialize logging and run; used by `main`
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli).context("initializing logging")?;
    info!("Starting Queue App Service");
    run(cli).await?;
    Ok(())
}
