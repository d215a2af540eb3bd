//! Request Governor
//!
//! Context object for outbound calls to the remote service. Constructed once
//! at startup and shared by handle (`Arc<RequestGovernor>`); dropping the last
//! handle releases the limiter and retry state.
//!
//! Every attempt goes through the token bucket first, then the operation.
//! Successful attempts feed `on_success`, rate-limited ones feed
//! `on_rate_limited` through the retry handler.

use crate::application::rate_limit::{AdaptiveRateLimiter, LimiterStats};
use crate::application::retry::RetryHandler;
use crate::config::{RateLimitConfig, RetryConfig};
use crate::error::{AppError, Classify, Result};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Cost of a single request in tokens
pub const DEFAULT_REQUEST_COST: f64 = 1.0;

pub struct RequestGovernor {
    rate_limiter: Arc<AdaptiveRateLimiter>,
    retry: RetryHandler,
}

impl RequestGovernor {
    pub fn new(rate_limit: &RateLimitConfig, retry: RetryConfig) -> Result<Self> {
        let rate_limiter = Arc::new(AdaptiveRateLimiter::new(rate_limit)?);
        let retry = RetryHandler::new(retry)?.with_rate_limiter(Arc::clone(&rate_limiter));

        info!(
            rate = rate_limiter.refill_rate(),
            capacity = rate_limiter.limiter().capacity(),
            max_retries = retry.config().max_retries,
            "Request governor initialized"
        );

        Ok(Self {
            rate_limiter,
            retry,
        })
    }

    pub fn rate_limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.rate_limiter
    }

    pub fn retry_handler(&self) -> &RetryHandler {
        &self.retry
    }

    pub fn stats(&self) -> LimiterStats {
        self.rate_limiter.stats()
    }

    /// Run `operation` under rate limiting and retry, at one token per attempt
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + Display + From<AppError>,
    {
        self.execute_with_cost(DEFAULT_REQUEST_COST, operation)
            .await
    }

    /// Like [`execute`](Self::execute) with a custom token cost per attempt
    ///
    /// A cost the bucket can never satisfy fails with a terminal
    /// `AppError::Config` converted into `E`.
    pub async fn execute_with_cost<F, Fut, T, E>(
        &self,
        cost: f64,
        mut operation: F,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + Display + From<AppError>,
    {
        let limiter = &self.rate_limiter;
        self.retry
            .execute(|| {
                let attempt = operation();
                async move {
                    limiter.acquire(cost).await.map_err(E::from)?;
                    let value = attempt.await?;
                    limiter.on_success();
                    Ok(value)
                }
            })
            .await
    }
}
