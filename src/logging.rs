//! Logging initialization for conductor.
//!
//! Session runs: logs to `<run_dir>/logs/conductor-{datetime}.log`
//! Query commands and validation failures: logs to stderr

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Result of logging initialization
pub struct LoggingHandle {
    /// Guard that must be kept alive for the duration of the program.
    /// When dropped, ensures all buffered logs are flushed.
    pub _guard: Option<WorkerGuard>,

    /// Path to the log file (only set when file logging is enabled)
    pub log_file_path: Option<PathBuf>,
}

/// Initialize logging for a session run.
///
/// `run_dir` is the session's run directory; when file logging is enabled
/// the log lands under `<run_dir>/logs/`. `debug_override` comes from the
/// `--debug` CLI flag.
pub fn init_session_logging(
    config: &Config,
    run_dir: &Path,
    debug_override: bool,
) -> Result<LoggingHandle> {
    let filter = env_filter(config, debug_override);

    if config.logging.to_file {
        let logs_dir = run_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;

        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let log_filename = format!("conductor-{timestamp}.log");
        let log_file_path = logs_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&logs_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .init();

        Ok(LoggingHandle {
            _guard: Some(guard),
            log_file_path: Some(log_file_path),
        })
    } else {
        init_stderr_logging(config, debug_override)
    }
}

/// Initialize stderr-only logging (status/sessions commands, early failures).
pub fn init_stderr_logging(config: &Config, debug_override: bool) -> Result<LoggingHandle> {
    tracing_subscriber::registry()
        .with(env_filter(config, debug_override))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(LoggingHandle {
        _guard: None,
        log_file_path: None,
    })
}

fn env_filter(config: &Config, debug_override: bool) -> tracing_subscriber::EnvFilter {
    let log_level = if debug_override {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or(log_level))
}
