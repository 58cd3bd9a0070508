//! # Structured Logging Module
//!
//! Environment-aware console logging for process workers. Log lines go to stdout,
//! optionally as JSON for container log shippers.

use crate::config::{ConfigManager, LoggingConfig};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging. Safe to call more than once; only the first call
/// installs a subscriber, and an already-installed global subscriber is left in place.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let directive = config
            .level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            environment = %environment,
            level = %directive,
            json = config.json,
            "Structured logging initialized"
        );
    });
}

/// Default level for an environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for a persisted step outcome
pub fn log_step_operation(
    operation: &str,
    process_id: Uuid,
    step_id: Option<Uuid>,
    step_type: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        process_id = %process_id,
        step_id = ?step_id,
        step_type = %step_type,
        status = %status,
        details = details,
        "STEP_OPERATION"
    );
}
