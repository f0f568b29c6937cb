use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DBTERM_LOG";
pub const LOG_FILE: &str = "dbterm.log";

/// `DBTERM_LOG` wins over the configured filter; a bad filter falls back to `info`.
pub fn filter_for(configured: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(configured))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs go to a file in `dir`; the terminal belongs to the UI.
///
/// The returned guard flushes the writer on drop and must outlive the app.
/// An already-installed global subscriber is kept.
pub fn init(dir: &Path, configured_filter: &str) -> io::Result<WorkerGuard> {
    fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::never(dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter_for(configured_filter))
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init();
    if installed.is_err() {
        tracing::debug!("global subscriber already set");
    }

    tracing::info!(log_dir = %dir.display(), "logging initialized");
    Ok(guard)
}
