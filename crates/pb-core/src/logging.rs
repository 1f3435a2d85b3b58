//! Logging infrastructure for pulsebridge

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, LogLevel};

/// Map a configured level onto a tracing level. `Off` has no counterpart.
pub fn level_for(log_level: LogLevel) -> Option<Level> {
    match log_level {
        LogLevel::Off => None,
        LogLevel::Error => Some(Level::ERROR),
        LogLevel::Warn => Some(Level::WARN),
        LogLevel::Info => Some(Level::INFO),
        LogLevel::Debug => Some(Level::DEBUG),
        LogLevel::Trace => Some(Level::TRACE),
    }
}

/// Install the global subscriber: console output plus an optional log file.
/// `RUST_LOG` overrides the configured level. Later calls are no-ops.
pub fn init(config: &Config) {
    let Some(level) = level_for(config.debug.log_level) else {
        return;
    };

    let (file_layer, file_error) = if config.debug.log_to_file {
        match open_log_file(&config.debug.log_path) {
            Ok(file) => (Some(fmt::layer().with_writer(Arc::new(file)).with_ansi(false)), None),
            Err(err) => (None, Some(err)),
        }
    } else {
        (None, None)
    };

    let console = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);
    let installed = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console)
        .with(file_layer)
        .try_init()
        .is_ok();

    if let (true, Some(err)) = (installed, file_error) {
        tracing::warn!("Logging to {} disabled: {}", config.debug.log_path.display(), err);
    }
}

/// Console logging at `info` (for tests and quick starts)
pub fn init_default() {
    let _ = tracing_subscriber::registry()
        .with(env_filter(Level::INFO))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

// Component-specific logging

/// Log a stream lifecycle trace message
#[macro_export]
macro_rules! stream_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "stream", $($arg)*)
    };
}

/// Log a stream lifecycle debug message
#[macro_export]
macro_rules! stream_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "stream", $($arg)*)
    };
}

/// Log a callback bridge trace message
#[macro_export]
macro_rules! bridge_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "bridge", $($arg)*)
    };
}

/// Log a callback bridge debug message
#[macro_export]
macro_rules! bridge_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "bridge", $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_disables_logging() {
        assert_eq!(level_for(LogLevel::Off), None);
        assert_eq!(level_for(LogLevel::Warn), Some(Level::WARN));
    }
}
