//! # Structured Logging Module
//!
//! Environment-aware structured logging for brokers and subscribers. Output
//! goes to stderr, as human-readable text by default or as JSON lines when
//! `QUEUE_BRIDGE_LOG_FORMAT=json`.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// `RUST_LOG`, when set, overrides the environment's default level.
pub fn init_structured_logging() {
    init_structured_logging_with_level(None);
}

/// Like [`init_structured_logging`], with `level` replacing the
/// environment's default. `RUST_LOG` still wins.
pub fn init_structured_logging_with_level(level: Option<&str>) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = resolve_filter(std::env::var("RUST_LOG").ok(), level, &environment);
        let json = json_output_requested();

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(&filter))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(EnvFilter::new(&filter))
                .boxed()
        };

        // Another subscriber (a host application or test harness) may already be set
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            filter = %filter,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("QUEUE_BRIDGE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        "test" => "debug".to_string(),
        _ => "debug".to_string(),
    }
}

fn resolve_filter(rust_log: Option<String>, level: Option<&str>, environment: &str) -> String {
    rust_log
        .filter(|filter| !filter.trim().is_empty())
        .or_else(|| level.map(str::to_string))
        .unwrap_or_else(|| get_log_level(environment))
}

fn json_output_requested() -> bool {
    std::env::var("QUEUE_BRIDGE_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log structured data for broker operations
pub fn log_broker_operation(
    operation: &str,
    provider: &str,
    topic: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        provider = %provider,
        topic = topic,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📨 BROKER_OPERATION"
    );
}

/// Hide the userinfo part of a broker URL before it reaches a log line
pub fn redact_address(address: &str) -> String {
    match (address.find("://"), address.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &address[..scheme_end], &address[at + 1..])
        }
        _ => address.to_string(),
    }
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
