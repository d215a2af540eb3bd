// Rate limit and retry configuration
//
// Durations are expressed in milliseconds (`*_ms` keys) in files and env vars.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sustained request rate (requests/second)
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 10.0;

/// Lower bound for the adaptive rate
pub const DEFAULT_MIN_RATE: f64 = 1.0;

/// Upper bound for the adaptive rate
pub const DEFAULT_MAX_RATE: f64 = 100.0;

/// Consecutive successes required before the rate is raised
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 10;

/// Multiplier applied on a success streak (+10%)
pub const DEFAULT_INCREASE_FACTOR: f64 = 1.1;

/// Multiplier applied on a rate-limit signal (halve)
pub const DEFAULT_DECREASE_FACTOR: f64 = 0.5;

/// Request timestamps kept for observed-rate calculation
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Trailing window for observed-rate calculation (60s)
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Longest server-suggested pause that is honored (1 hour)
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Default retry attempts after the first one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff base delay (1s)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default backoff ceiling (60s)
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Token bucket and adaptive limiter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Initial refill rate in tokens per second
    pub requests_per_second: f64,
    /// Bucket capacity; defaults to `requests_per_second`
    pub burst_size: Option<f64>,
    /// Honor server-supplied retry-after delays
    pub respect_retry_after: bool,
    pub min_rate: f64,
    pub max_rate: f64,
    pub success_threshold: u32,
    pub increase_factor: f64,
    pub decrease_factor: f64,
    pub history_size: usize,
    #[serde(rename = "rate_window_ms", with = "duration_ms")]
    pub rate_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst_size: None,
            respect_retry_after: true,
            min_rate: DEFAULT_MIN_RATE,
            max_rate: DEFAULT_MAX_RATE,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            increase_factor: DEFAULT_INCREASE_FACTOR,
            decrease_factor: DEFAULT_DECREASE_FACTOR,
            history_size: DEFAULT_HISTORY_SIZE,
            rate_window: DEFAULT_RATE_WINDOW,
        }
    }
}

impl RateLimitConfig {
    /// Plain token bucket: `capacity` tokens refilled at `refill_rate` per second
    pub fn bucket(capacity: f64, refill_rate: f64) -> Self {
        Self {
            requests_per_second: refill_rate,
            burst_size: Some(capacity),
            ..Default::default()
        }
    }

    /// Effective bucket capacity
    pub fn capacity(&self) -> f64 {
        self.burst_size.unwrap_or(self.requests_per_second)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(AppError::Config(format!("{} must be positive, got {}", name, v)))
            }
        };

        positive("requests_per_second", self.requests_per_second)?;
        positive("burst_size", self.capacity())?;
        positive("min_rate", self.min_rate)?;
        positive("max_rate", self.max_rate)?;

        if self.min_rate > self.max_rate {
            return Err(AppError::Config(format!(
                "min_rate ({}) exceeds max_rate ({})",
                self.min_rate, self.max_rate
            )));
        }
        if self.success_threshold == 0 {
            return Err(AppError::Config(
                "success_threshold must be at least 1".to_string(),
            ));
        }
        if !(self.increase_factor.is_finite() && self.increase_factor >= 1.0) {
            return Err(AppError::Config(format!(
                "increase_factor must be >= 1, got {}",
                self.increase_factor
            )));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor <= 1.0) {
            return Err(AppError::Config(format!(
                "decrease_factor must be in (0, 1], got {}",
                self.decrease_factor
            )));
        }
        if self.history_size == 0 {
            return Err(AppError::Config("history_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Exponential backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.exponential_base.is_finite() && self.exponential_base > 1.0) {
            return Err(AppError::Config(format!(
                "exponential_base must be > 1, got {}",
                self.exponential_base
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(AppError::Config(format!(
                "base_delay ({:?}) exceeds max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
