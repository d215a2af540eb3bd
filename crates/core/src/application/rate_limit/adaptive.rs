// Adaptive rate limiting: gradual increase on success, multiplicative decrease on throttling

use super::RateLimiter;
use crate::config::RateLimitConfig;
use crate::error::Result;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Default)]
struct Feedback {
    consecutive_successes: u32,
    consecutive_failures: u32,
    successful_requests: u64,
    rate_limited_requests: u64,
}

/// Snapshot of limiter activity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub rate_limited_requests: u64,
    /// Observed requests/second over the trailing window
    pub current_rate: f64,
    /// Configured refill rate right now
    pub refill_rate: f64,
    pub average_wait_secs: f64,
}

/// Token bucket whose refill rate follows feedback from the remote service
///
/// Invariant: `min_rate <= refill_rate <= max_rate`.
pub struct AdaptiveRateLimiter {
    limiter: RateLimiter,
    min_rate: f64,
    max_rate: f64,
    success_threshold: u32,
    increase_factor: f64,
    decrease_factor: f64,
    feedback: Mutex<Feedback>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        config.validate()?;

        let initial = config
            .requests_per_second
            .clamp(config.min_rate, config.max_rate);
        let limiter = RateLimiter::from_config(&RateLimitConfig {
            requests_per_second: initial,
            burst_size: Some(config.capacity()),
            ..config.clone()
        })?;

        Ok(Self {
            limiter,
            min_rate: config.min_rate,
            max_rate: config.max_rate,
            success_threshold: config.success_threshold,
            increase_factor: config.increase_factor,
            decrease_factor: config.decrease_factor,
            feedback: Mutex::new(Feedback::default()),
        })
    }

    fn feedback(&self) -> MutexGuard<'_, Feedback> {
        self.feedback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Underlying token bucket
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn acquire(&self, cost: f64) -> Result<()> {
        self.limiter.acquire(cost).await
    }

    pub fn set_retry_after(&self, delay: Duration) {
        self.limiter.set_retry_after(delay);
    }

    pub fn refill_rate(&self) -> f64 {
        self.limiter.refill_rate()
    }

    pub fn current_rate(&self) -> f64 {
        self.limiter.current_rate()
    }

    pub async fn wait_time(&self, cost: f64) -> Result<Duration> {
        self.limiter.wait_time(cost).await
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.feedback().consecutive_successes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.feedback().consecutive_failures
    }

    /// Record a successful request
    ///
    /// Every `success_threshold` consecutive successes raise the rate by
    /// `increase_factor`, capped at `max_rate`.
    pub fn on_success(&self) {
        let mut feedback = self.feedback();
        feedback.consecutive_successes += 1;
        feedback.consecutive_failures = 0;
        feedback.successful_requests += 1;

        if feedback.consecutive_successes >= self.success_threshold {
            feedback.consecutive_successes = 0;
            let rate = self.limiter.refill_rate();
            let new_rate = (rate * self.increase_factor).min(self.max_rate);
            if new_rate != rate {
                info!(
                    rate = %format!("{:.1}", new_rate),
                    "Increasing rate limit"
                );
                self.limiter.set_refill_rate(new_rate);
            }
        }
    }

    /// Record a rate-limit rejection from the service
    ///
    /// Cuts the rate by `decrease_factor` (floored at `min_rate`) and forwards
    /// any server-suggested delay to the bucket.
    pub fn on_rate_limited(&self, retry_after: Option<Duration>) {
        {
            let mut feedback = self.feedback();
            feedback.consecutive_failures += 1;
            feedback.consecutive_successes = 0;
            feedback.rate_limited_requests += 1;

            let rate = self.limiter.refill_rate();
            let new_rate = (rate * self.decrease_factor).max(self.min_rate);
            if new_rate != rate {
                warn!(
                    rate = %format!("{:.1}", new_rate),
                    consecutive_failures = feedback.consecutive_failures,
                    "Reducing rate limit"
                );
                self.limiter.set_refill_rate(new_rate);
            }
        }

        if let Some(delay) = retry_after {
            self.limiter.set_retry_after(delay);
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let (total_requests, total_wait) = self.limiter.totals();
        let feedback = self.feedback();
        let average_wait_secs = if total_requests > 0 {
            total_wait.as_secs_f64() / total_requests as f64
        } else {
            0.0
        };

        LimiterStats {
            total_requests,
            successful_requests: feedback.successful_requests,
            rate_limited_requests: feedback.rate_limited_requests,
            current_rate: self.limiter.current_rate(),
            refill_rate: self.limiter.refill_rate(),
            average_wait_secs,
        }
    }

    /// Reset the bucket and the feedback streaks; the current rate is kept
    pub async fn reset(&self) {
        self.limiter.reset().await;
        *self.feedback() = Feedback::default();
    }
}
