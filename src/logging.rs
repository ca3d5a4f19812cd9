//! Logging setup: console output via `tracing`, plus optional rolling file
//! output with a retention policy applied at startup.

use std::time::Duration;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialize logging. Returns the file writer guard when file logging is
/// enabled; the caller must keep it alive for the process lifetime or
/// buffered log lines are lost on exit.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    // Default to info level for all modules; can be overridden via RUST_LOG
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    if !config.enabled {
        subscriber.init();
        return None;
    }

    if let Err(e) = std::fs::create_dir_all(&config.directory) {
        eprintln!("Failed to create log directory {}: {}", config.directory, e);
    }

    cleanup_old_logs(config);

    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.directory, &config.file_prefix),
        "never" => tracing_appender::rolling::never(&config.directory, &config.file_prefix),
        // default to daily
        _ => tracing_appender::rolling::daily(&config.directory, &config.file_prefix),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    subscriber
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                // No ANSI colors in file output
                .with_ansi(false),
        )
        .init();

    Some(guard)
}

/// Delete log files that exceed the configured count or age limits.
pub fn cleanup_old_logs(config: &LoggingConfig) {
    use std::time::SystemTime;

    // Both limits at 0 means unlimited retention
    if config.max_files == 0 && config.max_age_days == 0 {
        return;
    }

    let log_dir = std::path::Path::new(&config.directory);
    if !log_dir.exists() {
        return;
    }

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("Failed to read log directory: {}", e);
            return;
        }
    };

    let mut log_files: Vec<_> = entries
        .filter_map(|entry_res| {
            let entry = entry_res.ok()?;
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            if !entry.file_name().to_str()?.starts_with(&config.file_prefix) {
                return None;
            }
            let modified = metadata.modified().ok()?;
            Some((entry.path(), modified))
        })
        .collect();

    // Newest first; anything past max_files by index is over the count limit
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let now = SystemTime::now();
    let max_age = Duration::from_secs(u64::from(config.max_age_days) * 24 * 60 * 60);
    let mut deleted = 0;

    for (idx, (path, modified)) in log_files.iter().enumerate() {
        let over_count = config.max_files > 0 && idx >= config.max_files as usize;
        let over_age = config.max_age_days > 0
            && now
                .duration_since(*modified)
                .map(|age| age > max_age)
                .unwrap_or(false);

        if over_count || over_age {
            match std::fs::remove_file(path) {
                Ok(()) => deleted += 1,
                Err(e) => eprintln!("Failed to delete log file {:?}: {}", path, e),
            }
        }
    }

    if deleted > 0 {
        eprintln!("Cleaned up {} old log file(s)", deleted);
    }
}
