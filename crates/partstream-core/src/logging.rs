//! Structured logging setup.
//!
//! The library itself only emits `tracing` events. Binaries and tests that
//! want to see them call [`init_logging`] once; `RUST_LOG` overrides the
//! configured level when set.
//!
//! # Example
//!
//! ```ignore
//! use partstream_core::logging::{LogConfig, LogLevel, init_logging};
//!
//! init_logging(&LogConfig::new().level(LogLevel::Debug).json(true))?;
//! ```

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Verbosity of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The filter directive for this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(LoggingError::InvalidLevel(other.to_string())),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogConfig {
    level: LogLevel,
    json: bool,
}

impl LogConfig {
    /// Info level, human readable output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the level.
    #[must_use]
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Emit one JSON object per event instead of pretty text.
    #[must_use]
    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    #[must_use]
    pub fn get_level(&self) -> LogLevel {
        self.level
    }

    #[must_use]
    pub fn is_json(&self) -> bool {
        self.json
    }
}

/// Errors from [`init_logging`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggingError {
    /// A level name could not be parsed.
    InvalidLevel(String),
    /// A global subscriber is already installed.
    Init(String),
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLevel(level) => write!(f, "invalid log level: {level}"),
            Self::Init(detail) => write!(f, "failed to initialize logging: {detail}"),
        }
    }
}

impl std::error::Error for LoggingError {}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.json {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_thread_ids(true);
        subscriber
            .with(json_layer)
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))
    } else {
        let pretty_layer = fmt::layer().with_target(true).with_line_number(true);
        subscriber
            .with(pretty_layer)
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_level_parsing() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(" warning ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(
            "loud".parse::<LogLevel>().unwrap_err(),
            LoggingError::InvalidLevel("loud".to_string())
        );
        assert_eq!(LogLevel::default().to_string(), "info");
    }

    #[test]
    fn test_config_builder() {
        let config = LogConfig::new().level(LogLevel::Trace).json(true);
        assert_eq!(config.get_level(), LogLevel::Trace);
        assert!(config.is_json());
    }

    #[test]
    #[serial]
    fn test_init_logging_is_global() {
        let config = LogConfig::new().level(LogLevel::Debug);
        let _ = init_logging(&config);
        let err = init_logging(&config.json(true)).unwrap_err();
        assert!(matches!(err, LoggingError::Init(_)));
    }
}
