//! Settings types.
//!
//! Field names serialize in camelCase to match the dashboard's JSON config.
//! Every struct defaults per-field, so a settings file only needs the values
//! it overrides.

use std::time::Duration;

use relay_core::BackoffPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Live channel connection.
    pub connection: ConnectionSettings,
    /// Cache freshness and eviction.
    pub cache: CacheSettings,
    /// HTTP refetch endpoint.
    pub http: HttpSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        if c.url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("connection.url is empty".into()));
        }
        if !(c.url.starts_with("ws://") || c.url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "connection.url must use ws:// or wss://, got {}",
                c.url
            )));
        }
        if c.base_delay_ms == 0 {
            return Err(SettingsError::InvalidValue("connection.baseDelayMs must be > 0".into()));
        }
        if c.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.connectTimeoutMs must be > 0".into(),
            ));
        }
        if c.max_delay_ms < c.base_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "connection.maxDelayMs ({}) below baseDelayMs ({})",
                c.max_delay_ms, c.base_delay_ms
            )));
        }
        if c.multiplier < 1.0 {
            return Err(SettingsError::InvalidValue(format!(
                "connection.multiplier must be >= 1.0, got {}",
                c.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&c.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "connection.jitterFactor must be within 0.0..=1.0, got {}",
                c.jitter_factor
            )));
        }
        if self.cache.gc_interval_ms == 0 {
            return Err(SettingsError::InvalidValue("cache.gcIntervalMs must be > 0".into()));
        }
        if self.http.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("http.timeoutMs must be > 0".into()));
        }
        Ok(())
    }
}

/// Live channel connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Delay before the first reconnect attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the reconnect delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Symmetric jitter applied to each delay (0.0 disables).
    pub jitter_factor: f64,
    /// Give up on a single connect attempt after this many milliseconds.
    pub connect_timeout_ms: u64,
    /// Treat the connection as dead after this long without inbound traffic.
    /// 0 disables the check.
    pub idle_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000/ws".to_string(),
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.2,
            connect_timeout_ms: 10_000,
            // server pings every 30s
            idle_timeout_ms: 75_000,
        }
    }
}

impl ConnectionSettings {
    /// Reconnect schedule described by these settings.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_factor: self.jitter_factor,
        }
    }

    /// Per-attempt connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Cache freshness and eviction settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Default window after which an entry counts as stale.
    pub stale_time_ms: u64,
    /// Evict an unreferenced entry once it has been idle this long.
    pub gc_time_ms: u64,
    /// How often the eviction sweep runs.
    pub gc_interval_ms: u64,
    /// Refetch over HTTP when subscribing to a stale key.
    pub refetch_on_subscribe: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stale_time_ms: 30_000,
            gc_time_ms: 300_000,
            gc_interval_ms: 60_000,
            refetch_on_subscribe: true,
        }
    }
}

impl CacheSettings {
    /// Default stale window.
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    /// Idle time before eviction.
    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    /// Sweep period.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

/// HTTP refetch settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    /// Base URL cache keys are resolved against. `None` disables refetching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 15_000,
        }
    }
}

impl HttpSettings {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_validate() {
        RelaySettings::default().validate().unwrap();
    }

    #[test]
    fn backoff_from_connection_settings() {
        let c = ConnectionSettings {
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
            ..Default::default()
        };
        let p = c.backoff();
        assert_eq!(p.delay(0), Duration::from_secs(1));
        assert_eq!(p.delay(5), Duration::from_secs(8));
    }

    #[test]
    fn idle_timeout_zero_disables() {
        let c = ConnectionSettings {
            idle_timeout_ms: 0,
            ..Default::default()
        };
        assert!(c.idle_timeout().is_none());
        assert_eq!(
            ConnectionSettings::default().idle_timeout(),
            Some(Duration::from_secs(75))
        );
    }

    #[test]
    fn rejects_cap_below_base() {
        let mut s = RelaySettings::default();
        s.connection.max_delay_ms = 10;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("maxDelayMs"));
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut s = RelaySettings::default();
        s.connection.connect_timeout_ms = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("connectTimeoutMs"));

        let mut s = RelaySettings::default();
        s.http.timeout_ms = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("http.timeoutMs"));

        assert!(RelaySettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_websocket_url() {
        let mut s = RelaySettings::default();
        s.connection.url = "http://example.com".into();
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let mut s = RelaySettings::default();
        s.connection.multiplier = 0.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn camel_case_serialization() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert_eq!(json["connection"]["baseDelayMs"], 1_000);
        assert_eq!(json["cache"]["staleTimeMs"], 30_000);
        assert_eq!(json["cache"]["refetchOnSubscribe"], true);
        assert!(json["http"].get("baseUrl").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"connection":{"url":"wss://tburn.io/ws"}}"#).unwrap();
        assert_eq!(s.connection.url, "wss://tburn.io/ws");
        assert_eq!(s.connection.max_delay_ms, 30_000);
        assert_eq!(s.cache.gc_time_ms, 300_000);
    }
}
