//! Reconnect backoff calculation.
//!
//! Delay before attempt `n` (zero-based):
//! `min(max_delay, base_delay * multiplier^n) * (1 ± jitter_factor)`.
//!
//! With base 1s, multiplier 2 and cap 8s the waits are 1s, 2s, 4s, 8s, 8s…,
//! so after a drop at t=0 the attempts land at t=1s, 3s, 7s, 15s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default growth factor per attempt.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplicative growth per attempt (values below 1.0 are treated as 1.0).
    pub multiplier: f64,
    /// Upper bound before jitter.
    pub max_delay: Duration,
    /// Symmetric jitter range; 0.2 means ±20%.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, handy for deterministic schedules.
    pub fn fixed_schedule(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    /// Delay before the zero-based `attempt`, with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.jitter_factor <= 0.0 {
            return self.delay_with_random(attempt, 0.5);
        }
        self.delay_with_random(attempt, rand::random::<f64>())
    }

    /// Delay before the zero-based `attempt`.
    ///
    /// `random` must be in `[0.0, 1.0)`; 0.5 yields the un-jittered value.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let multiplier = self.multiplier.max(1.0);

        let exponential = base_ms * multiplier.powi(attempt.min(64) as i32);
        let capped = exponential.min(max_ms);

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let factor = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter;
        let with_jitter = (capped * factor).round().max(0.0);

        Duration::from_millis(with_jitter as u64)
    }
}
