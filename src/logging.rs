//! Tracing setup driven by `[logging]` config.
//!
//! Without `dir`, output goes to stderr only. With `dir`, a daily-rotated JSON
//! file (`aegnix.log.YYYY-MM-DD`) is written alongside stderr so operator
//! actions leave a machine-readable trail. `RUST_LOG` overrides `level`.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// File name prefix of rotated log files.
pub const LOG_FILE_PREFIX: &str = "aegnix.log";

/// Keeps the background file writer alive. Dropping it flushes pending lines.
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the subscriber described by `config`.
///
/// Returns a guard when file logging is enabled; hold it until exit.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or another
/// subscriber already owns the process while file logging is requested.
pub fn init(config: &LoggingConfig) -> Result<Option<LoggingGuard>> {
    match &config.dir {
        Some(dir) => init_with_file(dir, &config.level).map(Some),
        None => {
            init_stderr(&config.level);
            Ok(None)
        }
    }
}

/// JSON lines to `{logs_dir}/aegnix.log.YYYY-MM-DD` plus plain stderr.
///
/// # Errors
///
/// Returns an error if `logs_dir` cannot be created or a global subscriber
/// is already installed.
pub fn init_with_file(logs_dir: &Path, level: &str) -> Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create log directory {}", logs_dir.display()))?;

    let (writer, worker) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(LoggingGuard { _worker: worker })
}

/// Plain stderr output. Keeps an already-installed subscriber.
pub fn init_stderr(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}
