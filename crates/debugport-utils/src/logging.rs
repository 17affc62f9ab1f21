//! # Logging Utilities
//!
//! Logging setup for debugport using `tracing`.
//!
//! The broker logs queue transitions, attach progress and teardown as
//! structured events (`pid`, `tid`, `session`, `attach`, `kind` fields). This
//! module turns those into console output, optionally mirrored to a daily
//! rolling file.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use debugport_utils::init_logging;
//!
//! // Reads RUST_LOG, DEBUGPORT_LOG_FORMAT and DEBUGPORT_LOG_FILE
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("broker started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (e.g. `debug`, `debugport_core::broker=trace`)
//! - `DEBUGPORT_LOG_FORMAT`: `pretty` (default) or `json`
//! - `DEBUGPORT_LOG_FILE`: mirror logs to this file, rolled daily
//!
//! Keep the returned [`LoggingGuard`] alive for as long as logs should reach
//! the file; dropping it flushes the file writer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::{DateTime, Utc};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const FORMAT_VAR: &str = "DEBUGPORT_LOG_FORMAT";
const FILE_VAR: &str = "DEBUGPORT_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable, with ANSI colors on the console
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
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
    /// Attach, detach and teardown milestones
    Info,
    /// Every queue transition
    Debug,
    /// Queue scans and tie-break decisions
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
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig
{
    /// Fixed level; overrides `RUST_LOG` when set
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    /// Mirror output to this file (rolled daily)
    pub file: Option<PathBuf>,
}

impl LogConfig
{
    /// Configuration from `DEBUGPORT_LOG_FORMAT` and `DEBUGPORT_LOG_FILE`.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidFormat` if `DEBUGPORT_LOG_FORMAT` is set to an
    /// unknown format.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        let format = match env::var(FORMAT_VAR) {
            Ok(raw) => raw.parse()?,
            Err(_) => LogFormat::default(),
        };
        let file = env::var_os(FILE_VAR).map(PathBuf::from);
        Ok(Self {
            level: None,
            format,
            file,
        })
    }

    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self
    {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self
    {
        self.file = Some(file.into());
        self
    }

    fn filter(&self) -> EnvFilter
    {
        match self.level {
            Some(level) => EnvFilter::new(Level::from(level).to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
        }
    }
}

/// Keeps the file writer alive. Dropping it flushes pending file output.
#[derive(Debug)]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
    started: DateTime<Utc>,
    file: Option<PathBuf>,
}

impl LoggingGuard
{
    /// When logging was initialised.
    pub fn started(&self) -> DateTime<Utc>
    {
        self.started
    }

    /// Directory and file prefix of the rolling log, if file logging is on.
    pub fn file(&self) -> Option<&Path>
    {
        self.file.as_deref()
    }
}

/// Initialize logging from the environment.
///
/// ## Errors
///
/// Returns an error if:
/// - `DEBUGPORT_LOG_FORMAT` holds an unknown format
/// - A global subscriber is already installed
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    init_logging_with(LogConfig::from_env()?)
}

/// Initialize logging with a fixed level and format, still honouring
/// `DEBUGPORT_LOG_FILE`.
///
/// ## Example
///
/// ```rust,no_run
/// use debugport_utils::{LogFormat, LogLevel, init_logging_with_level};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    let mut config = LogConfig::from_env().unwrap_or_default();
    config.level = Some(level);
    config.format = format;
    init_logging_with(config)
}

/// Initialize logging from an explicit configuration.
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging_with(config: LogConfig) -> Result<LoggingGuard, LoggingError>
{
    let mut layers = vec![console_layer(&config)];
    let worker = config.file.as_deref().map(|path| {
        let (layer, worker) = file_layer(&config, path);
        layers.push(layer);
        worker
    });

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;

    Ok(LoggingGuard {
        _file: worker,
        started: Utc::now(),
        file: config.file,
    })
}

fn console_layer(config: &LogConfig) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);
    match config.format {
        LogFormat::Pretty => layer.with_ansi(true).with_filter(config.filter()).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(config.filter())
            .boxed(),
    }
}

fn file_layer(config: &LogConfig, path: &Path) -> (BoxedLayer, WorkerGuard)
{
    let directory = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let prefix = path.file_name().unwrap_or_default();
    let (writer, worker) = tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, prefix));

    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false)
        .with_writer(writer);
    let layer = match config.format {
        LogFormat::Pretty => layer.with_filter(config.filter()).boxed(),
        LogFormat::Json => layer.json().with_filter(config.filter()).boxed(),
    };
    (layer, worker)
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Unknown log format '{0}', use 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("Unknown log level '{0}', use 'error', 'warn', 'info', 'debug' or 'trace'")]
    InvalidLevel(String),

    /// A global subscriber was already installed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),
}
