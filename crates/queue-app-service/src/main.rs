//! # Queue App Service
//!
//! Binary entry point. Runs the configured consumers until Ctrl-C or
//! SIGTERM, then stops them gracefully.

use queue_app_service::{run_cli, ServiceError};
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!("Service error: {:#}", e);
        eprintln!("queue-app-service: {:#}", e);

        let exit_code = e
            .downcast_ref::<ServiceError>()
            .map(ServiceError::exit_code)
            .unwrap_or(1);

        std::process::exit(exit_code);
    }
}
