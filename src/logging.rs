//! Server log setup
//!
//! Two outputs share one filter:
//! - **stdout**: human-readable, for whoever started the server
//! - **`<log-dir>/server.log`**: the same events without colors, written
//!   through a non-blocking appender so request handling never waits on disk
//!
//! Per-script failure logs are separate and written by the bridge.

use crate::config::LoggingConfig;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const SERVER_LOG_FILE: &str = "server.log";

/// Keeps the file writer alive; dropping it flushes `server.log`.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn server_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(SERVER_LOG_FILE)
}

/// Filter from `RUST_LOG`, with this crate at `info` (or `debug`) on top.
pub fn env_filter(debug: bool) -> EnvFilter {
    let level = if debug { "debug" } else { "info" };
    let directive = format!("lazycomm={level}")
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into());

    EnvFilter::from_default_env().add_directive(directive)
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init(config: &LoggingConfig, debug: bool) -> LoggingGuard {
    let mut file_error = None;
    let (file_layer, file_guard) = if config.server_log {
        match open_server_log(&config.dir) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                file_error = Some(e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(true);

    tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(stdout_layer)
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!(
            log_dir = %config.dir.display(),
            error = %e,
            "Could not open server log, logging to stdout only"
        );
    } else if config.server_log {
        tracing::debug!(path = %server_log_path(&config.dir).display(), "Server log opened");
    }

    LoggingGuard {
        _file_guard: file_guard,
    }
}

fn open_server_log(log_dir: &Path) -> std::io::Result<fs::File> {
    fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(server_log_path(log_dir))
}
