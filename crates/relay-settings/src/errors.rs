//! Failures while loading relay settings.
//!
//! File problems carry the offending path so the CLI can report it without
//! extra context.

use std::path::PathBuf;

use thiserror::Error;

/// Why relay settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read relay settings at {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not JSON, or a field has the wrong type.
    #[error("relay settings at {} are malformed: {source}", path.display())]
    Malformed {
        /// File that failed.
        path: PathBuf,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },
    /// The compiled defaults could not be turned into a JSON layer.
    #[error("cannot encode default relay settings: {0}")]
    Defaults(#[source] serde_json::Error),
    /// Values parse but the client cannot run with them.
    #[error("unusable relay setting: {0}")]
    InvalidValue(String),
}

impl SettingsError {
    /// The settings file involved, if the failure came from one.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Read { path, .. } | Self::Malformed { path, .. } => Some(path),
            Self::Defaults(_) | Self::InvalidValue(_) => None,
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_names_the_file() {
        let source = serde_json::from_str::<serde_json::Value>("{\"connection\":").unwrap_err();
        let err = SettingsError::Malformed {
            path: PathBuf::from("/home/ops/.relay/settings.json"),
            source,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("relay settings at /home/ops/.relay/settings.json are malformed"));
        assert_eq!(err.path(), Some(std::path::Path::new("/home/ops/.relay/settings.json")));
    }

    #[test]
    fn invalid_value_has_no_path() {
        let err = SettingsError::InvalidValue("connection.url must use ws:// or wss://".into());
        assert_eq!(
            err.to_string(),
            "unusable relay setting: connection.url must use ws:// or wss://"
        );
        assert!(err.path().is_none());
    }

    #[test]
    fn read_failure_keeps_io_source() {
        let err = SettingsError::Read {
            path: PathBuf::from("settings.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "denied");
    }
}
