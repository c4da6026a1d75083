//! Structured logging: console plus an optional daily rolling file.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "devices-connector";
const MAX_LOG_FILES: usize = 14;
const DEFAULT_FILTER: &str = "info,devices_connector=debug";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logging(log_dir: Option<&Path>) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = log_dir.and_then(|dir| {
        prune_old_logs(dir);
        if let Err(e) = fs::create_dir_all(dir) {
            eprintln!("Cannot create log directory {}: {e}", dir.display());
            return None;
        }
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        // Dropping the guard flushes and stops the writer; it must live until exit.
        std::mem::forget(guard);
        Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .is_ok()
}

/// Keep only the newest [`MAX_LOG_FILES`] connector log files in `dir`.
pub fn prune_old_logs(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
