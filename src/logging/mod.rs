//! Logging setup on the `tracing` ecosystem.
//!
//! The library itself only emits events (pass statistics, implementation
//! fallbacks, reorder decisions, cache hits). Binaries, benches and tests
//! call [`init_logging_default`] or [`init_with_config`] once.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter, e.g. `graphforge::rewrite=debug`
//! - `GRAPHFORGE_LOG_LEVEL`: simple level (error, warn, info, debug, trace)
//! - `GRAPHFORGE_LOG_FORMAT`: `human` or `json`
//! - `GRAPHFORGE_LOG_FILE`: optional file that receives JSON lines

use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "GRAPHFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "GRAPHFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "GRAPHFORGE_LOG_FILE";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to open log file {path}: {reason}")]
    FileOpenFailed { path: String, reason: String },

    #[error("a global subscriber is already installed: {0}")]
    SubscriberInstalled(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(LoggingError::InvalidFilter(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(LoggingError::InvalidFilter(format!("unknown log format '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file and line of each event
    pub with_file_info: bool,
    /// Emit an event when each span (pass run, program build) closes
    pub with_span_events: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `GRAPHFORGE_LOG_*`; unset or unparsable values keep defaults.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(level) = std::env::var(LOG_LEVEL_ENV).ok().and_then(|s| s.parse().ok()) {
            config.level = level;
        }
        if let Some(format) = std::env::var(LOG_FORMAT_ENV).ok().and_then(|s| s.parse().ok()) {
            config.format = format;
        }
        config.log_file = std::env::var(LOG_FILE_ENV).ok().map(PathBuf::from);
        config
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Initialize from the environment. Idempotent; failures are ignored so
/// tests and benches can call it freely.
pub fn init_logging_default() {
    let _ = init_with_config(&LoggingConfig::from_env());
}

/// Initialize with `config`. Only the first successful call installs a
/// subscriber; later calls return `Ok(())`.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }
    install(config)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_file(config.with_file_info)
        .with_line_number(config.with_file_info)
        .with_span_events(span_events(config.with_span_events));
    match config.format {
        LogFormat::Human => layer.with_target(true).boxed(),
        LogFormat::Json => layer.json().with_target(false).boxed(),
    }
}

/// The file always receives JSON so it can be post-processed.
fn file_layer(config: &LoggingConfig, path: &Path) -> Result<BoxedLayer, LoggingError> {
    let open_failed = |e: std::io::Error| LoggingError::FileOpenFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(open_failed)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(open_failed)?;
    Ok(fmt::layer()
        .json()
        .with_writer(file)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events(config.with_span_events))
        .boxed())
}

/// `RUST_LOG` wins over the configured level.
fn build_env_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    match std::env::var("RUST_LOG") {
        Ok(filter) => EnvFilter::try_new(filter).map_err(|e| LoggingError::InvalidFilter(e.to_string())),
        Err(_) => Ok(EnvFilter::new(level.as_filter_str())),
    }
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let mut layers = vec![console_layer(config)];
    if let Some(path) = &config.log_file {
        layers.push(file_layer(config, path)?);
    }
    tracing_subscriber::registry()
        .with(layers)
        .with(build_env_filter(config.level)?)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInstalled(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_default_idempotent() {
        init_logging_default();
        init_logging_default();
        assert!(init_with_config(&LoggingConfig::new()).is_ok() || !is_initialized());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" DEBUG ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Human);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Trace)
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_log_file("/tmp/graphforge.log");
        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_span_events);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/graphforge.log")));
    }

    #[test]
    fn test_file_layer_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("forge.log");
        file_layer(&LoggingConfig::new(), &path).unwrap();
        assert!(path.exists());
    }
}
