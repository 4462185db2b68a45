//! # relay-logging
//!
//! Installs the process-wide `tracing` subscriber for relay binaries, and
//! provides [`capture::capture_logs`] so tests can assert on emitted events.

#![deny(unsafe_code)]

pub mod capture;

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};

/// Errors from [`init_logging`].
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The configured level is not a tracing level.
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    /// A global subscriber is already installed.
    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Configuration for log output.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Default log level. Overridden by the `RUST_LOG` env var.
    pub level: Level,
    /// Per-module level overrides (e.g. `relay_client::transport` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Build a config from a textual level such as `"debug"`.
    pub fn from_level_str(level: &str, json: bool) -> Result<Self, LoggingError> {
        let level =
            Level::from_str(level.trim()).map_err(|_| LoggingError::InvalidLevel(level.to_string()))?;
        Ok(Self {
            level,
            json,
            ..Self::default()
        })
    }

    /// Filter directive string, e.g. `info,relay_client=debug`.
    pub fn directives(&self) -> String {
        let mut filter = self.level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Install the global subscriber. Call once at startup.
///
/// Output goes to stderr so stdout stays free for command output.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_levels() {
        let config = LoggingConfig {
            level: Level::WARN,
            module_levels: vec![("relay_client::transport".into(), Level::DEBUG)],
            json: false,
        };
        assert_eq!(config.directives(), "warn,relay_client::transport=debug");
    }

    #[test]
    fn parses_level_case_insensitively() {
        let config = LoggingConfig::from_level_str("DEBUG", true).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.json);
    }

    #[test]
    fn rejects_unknown_level() {
        let err = LoggingConfig::from_level_str("loud", false).unwrap_err();
        assert!(matches!(err, LoggingError::InvalidLevel(ref l) if l == "loud"));
    }

    #[test]
    fn second_init_fails_instead_of_panicking() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        let second = init_logging(&config);
        assert!(matches!(second, Err(LoggingError::Init(_))));
    }
}
