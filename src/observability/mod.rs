//! Structured logging for indexers.
//!
//! Every indexer logs through `tracing` inside a span named `indexer` that
//! carries its configured name, so several indexers can share one process
//! and still be told apart. This module installs the global subscriber.
//!
//! # Features
//!
//! - **Structured Logging**: Key-value fields (block ranges, event identity)
//! - **Multiple Formats**: Console (pretty/JSON) and file output
//! - **Environment Filtering**: `RUST_LOG` overrides the configured level
//!
//! # Usage
//!
//! ```no_run
//! use bloxer::config::LoggerConfig;
//! use bloxer::observability;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     // Keep the guard alive for as long as file logging is needed
//!     let _guard = observability::init_tracing(&LoggerConfig::default())?;
//!
//!     // Build and run indexers...
//!     Ok(())
//! }
//! ```
//!
//! # Environment Configuration
//!
//! ```bash
//! # Component-specific levels
//! RUST_LOG=bloxer=debug,sqlx=warn cargo run
//! ```

use crate::config::LoggerConfig;
use std::ffi::OsStr;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the global tracing subscriber from a [`LoggerConfig`].
///
/// - `RUST_LOG`, when set, wins over `logger.level`
/// - `logger.json` switches the console from pretty to JSON output
/// - `logger.file` adds a daily-rotated JSON file
///
/// Returns the file writer's guard when a file is configured. Logs still
/// buffered are flushed when it is dropped.
///
/// # Errors
///
/// Returns an error if:
/// - The log directory cannot be created
/// - A global subscriber is already installed
pub fn init_tracing(
    logger: &LoggerConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(filter) => EnvFilter::new(filter),
        Err(_) => EnvFilter::new(&logger.level),
    };

    let console_layer = if logger.json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    };

    let (file_layer, guard) = match &logger.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(directory)?;

            let appender = tracing_appender::rolling::daily(
                directory,
                path.file_name().unwrap_or_else(|| OsStr::new("indexer.log")),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);

            // Files are always JSON
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!(
        name = %logger.name,
        json_output = logger.json,
        file_logging = logger.file.is_some(),
        "Tracing initialized"
    );

    Ok(guard)
}

/// Initialize tracing for tests.
///
/// Output goes to the test harness; view it with `cargo test -- --nocapture`.
/// Safe to call from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::fmt::format::FmtSpan;

    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("bloxer=debug"))
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_init_is_rejected() {
        init_test_tracing();
        // A subscriber is installed now, so a second one must be refused.
        let result = init_tracing(&LoggerConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_file_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let logger = LoggerConfig {
            file: Some(dir.path().join("logs/indexer.log")),
            ..LoggerConfig::default()
        };

        // The directory is created before the subscriber is installed, so
        // this holds whether or not another test installed one first.
        let _ = init_tracing(&logger);
        assert!(dir.path().join("logs").is_dir());
    }
}
