//! Structured logging and diagnostics for wock.
//!
//! The CLI logs to stderr only. The daemon additionally writes every record
//! at debug level to its log file, which `wock logs` prints.

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// No logging (only errors)
    #[default]
    Quiet,
    /// Normal logging (info level)
    Normal,
    /// Verbose logging (debug level)
    Verbose,
    /// Very verbose logging (trace level)
    Trace,
}

impl Verbosity {
    /// Map a `-v` count onto a verbosity.
    pub fn from_occurrences(count: u8) -> Self {
        match count {
            0 => Verbosity::Quiet,
            1 => Verbosity::Normal,
            2 => Verbosity::Verbose,
            _ => Verbosity::Trace,
        }
    }

    /// Get the tracing level filter for this verbosity.
    pub fn as_level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::ERROR,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Verbose => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }

    /// Get the tracing level for this verbosity.
    pub fn as_level(&self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::INFO,
            Verbosity::Verbose => Level::DEBUG,
            Verbosity::Trace => Level::TRACE,
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity level for stderr output.
    pub verbosity: Verbosity,
    /// Optional path to log file.
    pub log_file: Option<PathBuf>,
    /// Write the log file as JSON lines instead of text.
    pub json: bool,
}

/// Guard that must be kept alive for the duration of logging.
///
/// When this guard is dropped, the logging system will flush pending logs.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self {
            _file_guard: file_guard,
        }
    }
}

/// Default daemon log file: `<cache dir>/wock/daemon.log`.
pub fn default_log_file() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("wock")
        .join("daemon.log")
}

/// Initialize the logging system.
///
/// Returns a guard that must be kept alive for the duration of logging.
/// When the guard is dropped, pending log entries will be flushed.
///
/// A log file that cannot be created is reported on stderr and skipped.
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.verbosity.as_level_filter().into())
        .from_env_lossy();

    // Set up file logging if configured
    let (file_layer, file_guard) = match config.log_file.as_deref().map(file_writer) {
        Some(Ok((non_blocking, guard))) => {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(non_blocking);
            // Always log at debug level to file
            let layer = if config.json {
                layer.json().with_filter(LevelFilter::DEBUG).boxed()
            } else {
                layer.with_filter(LevelFilter::DEBUG).boxed()
            };
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            eprintln!("Failed to open log file: {}", e);
            (None, None)
        }
        None => (None, None),
    };

    // Set up stderr logging only if verbosity is not Quiet
    let stderr_layer = if config.verbosity != Verbosity::Quiet {
        Some(
            fmt::layer()
                .with_ansi(true)
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_writer(std::io::stderr)
                .with_filter(config.verbosity.as_level_filter()),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LogGuard::new(file_guard)
}

fn file_writer(
    path: &Path,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let parent_dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent_dir)?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "daemon.log".to_string());

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(filename)
        .build(parent_dir)?;
    Ok(tracing_appender::non_blocking(file_appender))
}
