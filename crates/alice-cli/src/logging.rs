//! File logging for the bridge.
//!
//! Stdout carries the protocol, so diagnostics go to a file in the project
//! root instead.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "alice_runtime.log";
const LOG_ENV: &str = "ALICE_LOG";
const DEFAULT_DIRECTIVE: &str = "alice=info,alice_core=info";

/// Installs the global subscriber. Keep the guard alive until exit so
/// buffered lines are flushed.
///
/// # Errors
/// Returns an error if the log file cannot be opened or a subscriber is
/// already installed.
pub fn init(root: &Path) -> Result<WorkerGuard> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE)
        .build(root)
        .with_context(|| format!("open {LOG_FILE} in {}", root.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("install log subscriber: {e}"))?;

    Ok(guard)
}
