//! Tracing subscriber setup for hosts embedding the query core.
//!
//! Interactive terminals get console output only; otherwise logs go to a daily rolling file
//! with INFO and above mirrored to stdout. If the file appender cannot be created, logging
//! falls back to the console.

use crate::error::TuskError;

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for rolling log files
    pub log_dir: PathBuf,
    /// Console-only output when attached to a terminal
    pub is_tty: bool,
    /// Explicit filter, taking precedence over `TUSK_LOG` and `RUST_LOG`
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Configuration writing to `log_dir`, detecting whether stdout is a terminal.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, is_tty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Set an explicit filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Keeps the non-blocking file writer alive. Dropping it flushes pending entries.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Fails only if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<LoggingGuard, TuskError> {
    if config.is_tty {
        return init_console(config.log_filter.as_deref());
    }

    match file_writer(&config) {
        Ok((writer, guard)) => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stdout.with_max_level(tracing::Level::INFO).and(writer))
                .with_env_filter(build_env_filter(config.log_filter.as_deref()))
                .with_ansi(false)
                .with_target(true)
                .try_init()
                .map_err(|e| TuskError::config(format!("Logging already initialized: {e}")))?;
            Ok(LoggingGuard { _worker_guard: Some(guard) })
        }
        Err(e) => {
            eprintln!("Warning: failed to initialize file logging ({e}), using console only");
            init_console(config.log_filter.as_deref())
        }
    }
}

/// Install the global subscriber using the default log directory.
pub fn init_logging_default() -> Result<LoggingGuard, TuskError> {
    init_logging(LogConfig::new(crate::config::log_dir()?))
}

fn init_console(filter: Option<&str>) -> Result<LoggingGuard, TuskError> {
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(filter))
        .with_target(false)
        .try_init()
        .map_err(|e| TuskError::config(format!("Logging already initialized: {e}")))?;
    Ok(LoggingGuard { _worker_guard: None })
}

fn file_writer(
    config: &LogConfig,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), TuskError> {
    std::fs::create_dir_all(&config.log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("tusk-query")
        .filename_suffix("log")
        .build(&config.log_dir)
        .map_err(|e| TuskError::storage(format!("Failed to create log file: {e}"), None))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Filter precedence: explicit filter, then `TUSK_LOG`, then `RUST_LOG`, then the build default.
fn build_env_filter(explicit: Option<&str>) -> EnvFilter {
    if let Some(filter) = explicit {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env("TUSK_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Default filter for the current build type.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "info,tusk_query=debug,tokio_postgres=warn,deadpool=warn"
    } else {
        "warn,tusk_query=info,tokio_postgres=warn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(default_log_filter()).is_ok());
    }

    #[test]
    fn test_invalid_explicit_filter_falls_back() {
        let filter = build_env_filter(Some("tusk_query=notalevel"));
        assert_eq!(filter.to_string(), EnvFilter::new(default_log_filter()).to_string());
    }
}
