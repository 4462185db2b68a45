//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If `~/.relay/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! | Variable                | Field                       |
//! |-------------------------|-----------------------------|
//! | `RELAY_WS_URL`          | `connection.url`            |
//! | `RELAY_HTTP_BASE_URL`   | `http.baseUrl`              |
//! | `RELAY_BACKOFF_BASE_MS` | `connection.baseDelayMs`    |
//! | `RELAY_BACKOFF_MAX_MS`  | `connection.maxDelayMs`     |
//! | `RELAY_IDLE_TIMEOUT_MS` | `connection.idleTimeoutMs`  |
//! | `RELAY_STALE_TIME_MS`   | `cache.staleTimeMs`         |
//! | `RELAY_GC_TIME_MS`      | `cache.gcTimeMs`            |
//! | `RELAY_LOG_LEVEL`       | `logging.level`             |
//! | `RELAY_LOG_JSON`        | `logging.json`              |

use std::path::{Path, PathBuf};

use relay_core::deep_merge;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::RelaySettings;

/// Resolve the path to the settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a combination rejected by
/// [`RelaySettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = read_layered(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_layered(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default()).map_err(SettingsError::Defaults)?;
    let malformed = |source| SettingsError::Malformed {
        path: path.to_path_buf(),
        source,
    };

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(malformed)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    serde_json::from_value(merged).map_err(malformed)
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` instead of the process environment.
pub fn apply_overrides_from<F>(settings: &mut RelaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_WS_URL") {
        settings.connection.url = v;
    }
    if let Some(v) = env.u64("RELAY_BACKOFF_BASE_MS", 1, 600_000) {
        settings.connection.base_delay_ms = v;
    }
    if let Some(v) = env.u64("RELAY_BACKOFF_MAX_MS", 1, 3_600_000) {
        settings.connection.max_delay_ms = v;
    }
    if let Some(v) = env.u64("RELAY_IDLE_TIMEOUT_MS", 0, 3_600_000) {
        settings.connection.idle_timeout_ms = v;
    }

    // ── Cache ───────────────────────────────────────────────────────
    if let Some(v) = env.u64("RELAY_STALE_TIME_MS", 0, 86_400_000) {
        settings.cache.stale_time_ms = v;
    }
    if let Some(v) = env.u64("RELAY_GC_TIME_MS", 0, 86_400_000) {
        settings.cache.gc_time_ms = v;
    }

    // ── HTTP ────────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_HTTP_BASE_URL") {
        settings.http.base_url = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("RELAY_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid u64 env var, ignoring");
        }
        result
    }
}
