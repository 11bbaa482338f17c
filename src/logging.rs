//! Logging and tracing utilities for providers.
//!
//! This module provides helpers for setting up structured logging using the
//! `tracing` ecosystem. All logs are written to **stderr**: stdout carries the
//! plugin handshake and must not contain anything else.
//!
//! # Quick Start
//!
//! ```ignore
//! use tfplugin_sdk::{init_logging, serve, ResourceRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!
//!     tracing::info!("Starting provider");
//!     serve(ResourceRegistry::new()).await
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `debug`, `tfplugin_sdk=debug`)
//! - `TF_LOG_PROVIDER`: Terraform's provider log level (`TRACE`, `DEBUG`, `INFO`,
//!   `WARN`, `ERROR`, `OFF`), used when `RUST_LOG` is not set
//!
//! # Examples
//!
//! ```bash
//! # Let Terraform pick the level
//! TF_LOG_PROVIDER=DEBUG terraform apply
//!
//! # Show debug logs for the SDK only
//! RUST_LOG=tfplugin_sdk=debug terraform apply
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Terraform's environment variable for the provider log level.
pub const TF_LOG_PROVIDER_ENV: &str = "TF_LOG_PROVIDER";

/// Translate a Terraform log level into a filter directive.
fn terraform_level(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" | "JSON" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARN" => Some("warn"),
        "ERROR" => Some("error"),
        "OFF" => Some("off"),
        _ => None,
    }
}

/// Build the filter: `RUST_LOG` first, then `TF_LOG_PROVIDER`, then `default_level`.
fn build_filter(default_level: &str, tf_log: Option<String>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = tf_log
            .as_deref()
            .and_then(terraform_level)
            .unwrap_or(default_level);
        EnvFilter::new(level)
    })
}

fn subscriber(filter: EnvFilter) -> impl tracing::Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
}

/// Initialize the default logging subscriber.
///
/// This sets up a `tracing` subscriber that:
/// - Writes to **stderr** (stdout is reserved for the handshake)
/// - Respects `RUST_LOG`, then `TF_LOG_PROVIDER`
/// - Defaults to `info` level if neither is set
/// - Uses a compact, human-readable format
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    subscriber(build_filter("info", std::env::var(TF_LOG_PROVIDER_ENV).ok())).init();
}

/// Initialize logging with a custom default level.
///
/// Like [`init_logging`], but allows specifying the level used when neither
/// environment variable is set.
///
/// # Example
///
/// ```ignore
/// use tfplugin_sdk::init_logging_with_default;
///
/// fn main() {
///     init_logging_with_default("debug");
/// }
/// ```
pub fn init_logging_with_default(default_level: &str) {
    subscriber(build_filter(default_level, std::env::var(TF_LOG_PROVIDER_ENV).ok())).init();
}

/// Try to initialize logging, returning false if already initialized.
///
/// Unlike [`init_logging`], this function does not panic if a subscriber
/// has already been set. This is useful in test scenarios or when
/// the provider might be initialized multiple times.
pub fn try_init_logging() -> bool {
    subscriber(build_filter("info", std::env::var(TF_LOG_PROVIDER_ENV).ok()))
        .try_init()
        .is_ok()
}
