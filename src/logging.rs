//! Logging for the node agent.
//!
//! One tracing subscriber for the whole process: console output on
//! stderr, plus optional non-blocking file output when a log directory
//! is configured. Files roll daily (`nodewarden.log.YYYY-MM-DD`) so a
//! long-lived agent never grows a single unbounded log.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Prefix of the rolled log files.
pub const LOG_FILE_PREFIX: &str = "nodewarden.log";

/// Errors from logging setup.
#[derive(Debug, Error)]
pub enum LogInitError {
    /// The log directory could not be prepared.
    #[error("failed to prepare log directory: {0}")]
    Io(#[from] io::Error),

    /// A subscriber is already installed for this process.
    #[error("logging is already initialized")]
    AlreadyInitialized,
}

/// Keeps the background file writer alive.
///
/// Dropping the guard flushes buffered file output; hold it for the
/// lifetime of the process.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the process-wide subscriber.
///
/// Verbosity comes from `RUST_LOG`, defaulting to `info`. Console
/// output always goes to stderr; with a log directory the same events
/// also land in daily-rolled files under it.
///
/// # Errors
///
/// Fails when the log directory cannot be created or when another
/// subscriber already claimed the process.
pub fn init(log_dir: Option<&Path>) -> Result<LogGuard, LogInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .compact();
    let base = tracing_subscriber::registry().with(filter).with(console);

    let guard = match log_dir {
        Some(dir) => {
            let (writer, guard) = file_writer(dir)?;
            let files = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            base.with(files)
                .try_init()
                .map_err(|_| LogInitError::AlreadyInitialized)?;
            Some(guard)
        }
        None => {
            base.try_init()
                .map_err(|_| LogInitError::AlreadyInitialized)?;
            None
        }
    };

    Ok(LogGuard { _file: guard })
}

/// Builds the non-blocking writer for daily-rolled files under `dir`,
/// creating the directory on first use.
fn file_writer(dir: &Path) -> Result<(NonBlocking, WorkerGuard), io::Error> {
    fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}
