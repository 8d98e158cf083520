//! Process-wide tracing setup.
//!
//! Linux hosts log to the systemd journal when it accepts a connection.
//! Everywhere else, and when the journal is down, records go to a file that
//! rolls over daily.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "LIGHTHOUSE_LOG";

const DEFAULT_DIRECTIVE: &str = "info";
const LOG_FILE_PREFIX: &str = "lighthouse.log";

// Dropping the guard stops the background writer.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Call once, before the library starts.
///
/// `log_dir` is only used by the file backend and defaults to
/// [`default_log_dir`]. The filter comes from `LIGHTHOUSE_LOG`, e.g.
/// `debug` or `lighthouse::indexer=trace,info`.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald)
                .try_init()?;
            tracing::info!(backend = "journald", "Logging ready");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    init_file(&log_dir)
}

fn init_file(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Cannot create log directory {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;
    tracing::info!(backend = "file", log_dir = %log_dir.display(), "Logging ready");
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// `<local data dir>/lighthouse/logs`, or `./lighthouse/logs` without one.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lighthouse")
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_dir() {
        assert!(default_log_dir().ends_with("lighthouse/logs"));
    }
}
