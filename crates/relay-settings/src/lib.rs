//! # relay-settings
//!
//! Configuration for the relay client, supplied by the host application.
//!
//! Loading flow: compiled defaults, then `~/.relay/settings.json` (deep-merged),
//! then environment variables. See [`loader`] for the variable names.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{CacheSettings, ConnectionSettings, HttpSettings, LoggingSettings, RelaySettings};
