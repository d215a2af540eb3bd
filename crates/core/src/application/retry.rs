// Retry logic with exponential backoff
use crate::application::rate_limit::AdaptiveRateLimiter;
use crate::config::{RetryConfig, MAX_RETRY_AFTER};
use crate::error::{Classify, ErrorKind, Result};
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Retry decision for one failed attempt
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay
    Retry(Duration),
    /// Give up and propagate the error
    GiveUp,
}

/// Executes fallible async operations with classified retries
///
/// Each `execute` call keeps its own attempt counter, so one handler can be
/// shared by concurrent callers.
pub struct RetryHandler {
    config: RetryConfig,
    rate_limiter: Option<Arc<AdaptiveRateLimiter>>,
}

impl RetryHandler {
    /// Create a new retry handler
    ///
    /// # Arguments
    /// * `config` - Backoff settings, validated here
    ///
    /// # Example
    /// ```text
    /// let handler = RetryHandler::new(RetryConfig::default())?;
    /// let body = handler.execute(|| client.get("/nodes")).await?;
    /// ```
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rate_limiter: None,
        })
    }

    /// Report rate-limited attempts to `limiter` so it can slow down
    pub fn with_rate_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff delay before retry number `attempt` (0-indexed)
    ///
    /// Formula: `min(base_delay * exponential_base ^ attempt, max_delay)`,
    /// scaled by a random factor in `[0.5, 1.5)` when jitter is on and
    /// clamped to `max_delay` again afterwards.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_secs = self.config.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = (self.config.base_delay.as_secs_f64()
            * self.config.exponential_base.powi(exponent))
        .min(max_secs);

        if self.config.jitter {
            secs = (secs * rand::thread_rng().gen_range(0.5..1.5)).min(max_secs);
        }

        Duration::from_secs_f64(secs)
    }

    /// Decide what to do after `attempt` (0-indexed) failed with `kind`
    pub fn decide(&self, kind: &ErrorKind, attempt: u32) -> RetryDecision {
        if !kind.is_retryable() || attempt >= self.config.max_retries {
            return RetryDecision::GiveUp;
        }

        match kind {
            ErrorKind::RateLimited {
                retry_after: Some(delay),
            } => RetryDecision::Retry((*delay).min(MAX_RETRY_AFTER)),
            _ => RetryDecision::Retry(self.delay_for_attempt(attempt)),
        }
    }

    /// Run `operation`, retrying rate-limited and transient failures
    ///
    /// Returns the first success, or the most recent error once retries are
    /// exhausted. Terminal and internal errors propagate immediately.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + Display,
    {
        let total_attempts = self.config.max_retries + 1;
        let mut attempt: u32 = 0;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = err.kind();
            if let (ErrorKind::RateLimited { retry_after }, Some(limiter)) =
                (&kind, &self.rate_limiter)
            {
                limiter.on_rate_limited(*retry_after);
            }

            match self.decide(&kind, attempt) {
                RetryDecision::Retry(delay) => {
                    match kind {
                        ErrorKind::RateLimited { .. } => warn!(
                            delay_secs = %format!("{:.1}", delay.as_secs_f64()),
                            attempt = attempt + 1,
                            total_attempts = total_attempts,
                            "Rate limit hit, retrying"
                        ),
                        _ => warn!(
                            delay_secs = %format!("{:.1}", delay.as_secs_f64()),
                            attempt = attempt + 1,
                            total_attempts = total_attempts,
                            error = %err,
                            "Network/timeout error, retrying"
                        ),
                    }
                    sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    if kind.is_retryable() {
                        error!(error = %err, attempts = attempt + 1, "Max retries reached");
                    } else {
                        error!(error = %err, "Non-retryable error");
                    }
                    return Err(err);
                }
            }
        }
    }
}
