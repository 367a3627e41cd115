//! # Logging Utilities
//!
//! Logging setup for the Tether binaries using `tracing`.
//!
//! The libraries only emit `tracing` events; whichever binary embeds them
//! decides where those events go by calling [`init_logging`] once at startup.
//! Console output goes to stderr so command output on stdout stays clean
//! enough to pipe.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether_utils::{init_logging, LogConfig};
//!
//! let _guard = init_logging(&LogConfig::from_env()?)?;
//! tracing::info!("Broker started");
//! # Ok::<(), tether_utils::LoggingError>(())
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level filter (e.g. `RUST_LOG=debug`, `RUST_LOG=tether_protocol=debug`)
//! - `TETHER_LOG_FORMAT`: `pretty` (default) or `json`
//! - `TETHER_LOG_FILE`: also write to a daily rolling file at this path
//!
//! An explicit level (the CLI's `--log-level`) beats `RUST_LOG`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_VAR: &str = "TETHER_LOG_FORMAT";

/// Environment variable naming an additional log file.
pub const LOG_FILE_VAR: &str = "TETHER_LOG_FILE";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable, for terminals
    #[default]
    Pretty,
    /// One JSON object per event, for collectors
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// How the process should log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogConfig
{
    /// Overrides `RUST_LOG` when set
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    /// Extra daily-rolling log file
    pub file: Option<PathBuf>,
}

impl LogConfig
{
    /// Read `TETHER_LOG_FORMAT` and `TETHER_LOG_FILE`.
    ///
    /// ## Errors
    ///
    /// `InvalidFormat` if `TETHER_LOG_FORMAT` is set to something unknown.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        let format = match env::var(LOG_FORMAT_VAR) {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::default(),
        };
        let file = env::var_os(LOG_FILE_VAR).map(PathBuf::from);

        Ok(Self {
            level: None,
            format,
            file,
        })
    }

    #[must_use]
    pub fn with_level(mut self, level: Option<LogLevel>) -> Self
    {
        self.level = level;
        self
    }

    /// Filter directive in effect: explicit level, then `RUST_LOG`, then `info`.
    #[must_use]
    pub fn filter(&self) -> EnvFilter
    {
        if let Some(level) = self.level {
            return EnvFilter::new(Level::from(level).to_string());
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    }
}

/// Keeps the background file writer alive.
///
/// Dropping it flushes and stops file logging, so hold it for the life of
/// `main`.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// ## Errors
///
/// - `InitializationFailed` if a global subscriber is already installed
/// - `FileError` if the log file's directory can't be created
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard, LoggingError>
{
    let mut layers = vec![console_layer(config)];
    let mut guard = None;

    if let Some(path) = &config.file {
        let (directory, file_name) = split_log_path(path)?;
        std::fs::create_dir_all(&directory)?;
        let appender = tracing_appender::rolling::daily(directory, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);

        let layer = match config.format {
            LogFormat::Pretty => fmt::layer()
                .with_writer(writer)
                .with_thread_names(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_filter(config.filter())
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_thread_names(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_current_span(true)
                .with_filter(config.filter())
                .boxed(),
        };
        layers.push(layer);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;

    Ok(LoggingGuard { _file: guard })
}

fn console_layer(config: &LogConfig) -> Box<dyn Layer<Registry> + Send + Sync>
{
    match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_writer(io::stderr)
            .with_filter(config.filter())
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .with_filter(config.filter())
            .boxed(),
    }
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf), LoggingError>
{
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidPath(path.to_path_buf()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((directory, PathBuf::from(file_name)))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Unknown log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("Unknown log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    #[error("Log file path {} has no file name", .0.display())]
    InvalidPath(PathBuf),

    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
