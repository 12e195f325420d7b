//! File logging for sessdex
//!
//! Stdout belongs to the CLI's reports, so everything the index does goes to
//! a dated file in the state directory instead:
//!
//! ```text
//! $XDG_STATE_HOME/sessdex/sessdex.log.2025-11-25
//! ```
//!
//! One file per UTC day. When a new day starts, files beyond
//! `[logging] max_files` are deleted oldest first.
//!
//! What ends up there, by level:
//! - `info`: coordinator start and stop, one line per finished refresh with
//!   its counters, store retries
//! - `warn`: parse failures, unreadable roots, session id collisions
//! - `debug`: per-file parse results, root state transitions
//!
//! `RUST_LOG` replaces `[logging] level` entirely when set.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix; the appender appends `.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "sessdex.log";

/// Install the global file subscriber.
///
/// Lines are written by a background thread; keep the returned guard alive
/// until exit or the tail of the log is lost.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let (writer, guard) = tracing_appender::non_blocking(daily_appender(&log_dir, config)?);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(level_filter(config))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install log subscriber: {}", e)))?;

    tracing::info!(
        log_file = %log_file_for(Utc::now().date_naive()).display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

fn daily_appender(dir: &Path, config: &LoggingConfig) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))
}

fn level_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Flushes buffered log lines when dropped.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// The file that holds a given UTC day's log lines.
pub fn log_file_for(day: NaiveDate) -> PathBuf {
    dated_file(&Config::state_dir(), day)
}

fn dated_file(dir: &Path, day: NaiveDate) -> PathBuf {
    dir.join(format!("{LOG_FILE_PREFIX}.{}", day.format("%Y-%m-%d")))
}
