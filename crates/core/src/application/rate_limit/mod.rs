//! Rate Limiter (Token Bucket Algorithm)
//!
//! Paces outbound requests to the remote service. Tokens refill continuously
//! at `refill_rate` per second up to `capacity`; callers wait until enough
//! tokens exist.
//!
//! Waiting acquirers hold the bucket lock while they sleep, so waiters are
//! served in arrival order (tokio's mutex is fair) and none can starve.
//! `acquire` is cancel-safe: dropping the future before it returns consumes
//! nothing.

mod adaptive;

pub use adaptive::{AdaptiveRateLimiter, LimiterStats};

use crate::config::{RateLimitConfig, MAX_RETRY_AFTER};
use crate::error::{AppError, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Slack for floating point drift when comparing tokens against a cost
const TOKEN_EPSILON: f64 = 1e-9;

/// Token bucket state, only touched under the async bucket lock
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_refill = now;
    }
}

/// State read and written outside the bucket lock (short critical sections)
struct Shared {
    refill_rate: f64,
    retry_after_until: Option<Instant>,
    history: VecDeque<Instant>,
    total_requests: u64,
    total_wait: Duration,
}

/// Token bucket rate limiter
pub struct RateLimiter {
    capacity: f64,
    respect_retry_after: bool,
    history_size: usize,
    rate_window: Duration,
    bucket: tokio::sync::Mutex<Bucket>,
    shared: Mutex<Shared>,
}

impl RateLimiter {
    /// Create a new rate limiter with default history settings
    ///
    /// # Arguments
    /// * `capacity` - Maximum burst size
    /// * `refill_rate` - Tokens added per second
    ///
    /// # Example
    /// Allow 10 requests/sec with burst of 20:
    /// `RateLimiter::new(20.0, 10.0)`
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        Self::from_config(&RateLimitConfig::bucket(capacity, refill_rate))
    }

    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.capacity();
        let now = Instant::now();

        Ok(Self {
            capacity,
            respect_retry_after: config.respect_retry_after,
            history_size: config.history_size,
            rate_window: config.rate_window,
            bucket: tokio::sync::Mutex::new(Bucket {
                tokens: capacity,
                last_refill: now,
            }),
            shared: Mutex::new(Shared {
                refill_rate: config.requests_per_second,
                retry_after_until: None,
                history: VecDeque::with_capacity(config.history_size),
                total_requests: 0,
                total_wait: Duration::ZERO,
            }),
        })
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Current refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.shared().refill_rate
    }

    pub(crate) fn set_refill_rate(&self, rate: f64) {
        self.shared().refill_rate = rate;
    }

    fn check_cost(&self, cost: f64) -> Result<()> {
        if !(cost.is_finite() && cost > 0.0) {
            return Err(AppError::Config(format!(
                "acquire cost must be positive, got {}",
                cost
            )));
        }
        if cost > self.capacity {
            return Err(AppError::Config(format!(
                "acquire cost {} exceeds bucket capacity {}",
                cost, self.capacity
            )));
        }
        Ok(())
    }

    /// Wait until `cost` tokens are available, then consume them
    ///
    /// Waits out an active retry-after deadline first. Only fails for a cost
    /// that could never be satisfied (non-positive or above capacity).
    pub async fn acquire(&self, cost: f64) -> Result<()> {
        self.check_cost(cost)?;
        let started = Instant::now();
        let mut bucket = self.bucket.lock().await;

        loop {
            let deadline = self.shared().retry_after_until;
            if let Some(until) = deadline {
                let now = Instant::now();
                if until > now {
                    info!(
                        wait_secs = %format!("{:.1}", (until - now).as_secs_f64()),
                        "Rate limited, waiting out retry-after"
                    );
                    sleep_until(until).await;
                }
                let mut shared = self.shared();
                if shared.retry_after_until == Some(until) {
                    shared.retry_after_until = None;
                }
                continue;
            }

            let rate = self.refill_rate();
            bucket.refill(self.capacity, rate, Instant::now());

            if bucket.tokens + TOKEN_EPSILON >= cost {
                bucket.tokens = (bucket.tokens - cost).max(0.0);
                break;
            }

            let wait = Duration::from_secs_f64((cost - bucket.tokens) / rate);
            debug!(
                wait_ms = wait.as_millis() as u64,
                tokens = bucket.tokens,
                cost = cost,
                "Rate limiting: waiting for refill"
            );
            sleep(wait).await;
        }
        drop(bucket);

        let now = Instant::now();
        let mut shared = self.shared();
        if shared.history.len() == self.history_size {
            shared.history.pop_front();
        }
        shared.history.push_back(now);
        shared.total_requests += 1;
        shared.total_wait += now - started;
        Ok(())
    }

    /// Block every acquire until `delay` has passed
    ///
    /// Ignored when the limiter is configured not to respect retry-after.
    /// Delays longer than `MAX_RETRY_AFTER` are cut to it.
    pub fn set_retry_after(&self, delay: Duration) {
        if !self.respect_retry_after {
            debug!(delay_secs = delay.as_secs_f64(), "Ignoring server retry-after");
            return;
        }
        let delay = delay.min(MAX_RETRY_AFTER);
        self.shared().retry_after_until = Some(Instant::now() + delay);
        warn!(delay_secs = delay.as_secs_f64(), "Server requested retry after delay");
    }

    /// Tokens currently in the bucket (after lazy refill)
    ///
    /// Waits behind any acquire that is currently sleeping for tokens.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.capacity, self.refill_rate(), Instant::now());
        bucket.tokens
    }

    /// How long an acquire of `cost` would wait right now, without consuming
    pub async fn wait_time(&self, cost: f64) -> Result<Duration> {
        self.check_cost(cost)?;
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let (rate, deadline) = {
            let shared = self.shared();
            (shared.refill_rate, shared.retry_after_until)
        };

        let retry_wait = deadline
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();

        bucket.refill(self.capacity, rate, now);
        let deficit = (cost - bucket.tokens).max(0.0);
        let token_wait = if deficit > TOKEN_EPSILON {
            Duration::from_secs_f64(deficit / rate)
        } else {
            Duration::ZERO
        };

        Ok(retry_wait + token_wait)
    }

    /// Observed requests/second over the trailing rate window
    ///
    /// Returns 0 when fewer than two requests fall inside the window.
    pub fn current_rate(&self) -> f64 {
        let now = Instant::now();
        let shared = self.shared();
        let mut recent = shared
            .history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.rate_window);

        let Some(first) = recent.next() else {
            return 0.0;
        };
        let count = 1 + recent.count();
        if count < 2 {
            return 0.0;
        }

        let span = now.saturating_duration_since(*first).as_secs_f64();
        if span > 0.0 {
            count as f64 / span
        } else {
            0.0
        }
    }

    pub(crate) fn totals(&self) -> (u64, Duration) {
        let shared = self.shared();
        (shared.total_requests, shared.total_wait)
    }

    /// Refill to capacity and clear history, counters and any retry-after
    pub async fn reset(&self) {
        let mut bucket = self.bucket.lock().await;
        bucket.tokens = self.capacity;
        bucket.last_refill = Instant::now();

        let mut shared = self.shared();
        shared.history.clear();
        shared.retry_after_until = None;
        shared.total_requests = 0;
        shared.total_wait = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::task::JoinSet;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff <= Duration::from_millis(20),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_capacity_does_not_wait() {
        let limiter = RateLimiter::new(10.0, 5.0).unwrap();
        let start = Instant::now();

        for _ in 0..10 {
            limiter.acquire(1.0).await.unwrap();
        }

        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_deficit() {
        let limiter = RateLimiter::new(10.0, 10.0).unwrap();
        limiter.acquire(10.0).await.unwrap();

        let start = Instant::now();
        limiter.acquire(3.0).await.unwrap();

        // (3 - 0) / 10 tokens per second
        assert_close(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_half_second() {
        let limiter = RateLimiter::new(10.0, 10.0).unwrap();
        limiter.acquire(10.0).await.unwrap();

        sleep(Duration::from_millis(500)).await;

        let tokens = limiter.available_tokens().await;
        assert!((4.0..=6.0).contains(&tokens), "tokens = {}", tokens);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_capped_at_capacity() {
        let limiter = RateLimiter::new(5.0, 10.0).unwrap();
        sleep(Duration::from_secs(1)).await;

        assert_eq!(limiter.available_tokens().await, 5.0);
    }

    #[tokio::test]
    async fn test_rejects_cost_above_capacity() {
        let limiter = RateLimiter::new(5.0, 10.0).unwrap();

        assert!(matches!(
            limiter.acquire(6.0).await,
            Err(AppError::Config(_))
        ));
        assert!(limiter.acquire(0.0).await.is_err());
        assert!(limiter.acquire(f64::NAN).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquires_do_not_double_spend() {
        let limiter = Arc::new(RateLimiter::new(10.0, 5.0).unwrap());
        let start = Instant::now();

        // 15 tokens requested against a bucket of 10
        let mut tasks = JoinSet::new();
        for _ in 0..5 {
            let limiter = Arc::clone(&limiter);
            tasks.spawn(async move { limiter.acquire(3.0).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        // 5 missing tokens at 5 tokens/sec
        assert!(start.elapsed() >= Duration::from_millis(990));
        let tokens = limiter.available_tokens().await;
        assert!((0.0..=10.0).contains(&tokens));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_waited_once() {
        let limiter = RateLimiter::new(10.0, 10.0).unwrap();
        limiter.set_retry_after(Duration::from_secs(2));

        let start = Instant::now();
        limiter.acquire(1.0).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));

        let start = Instant::now();
        limiter.acquire(1.0).await.unwrap();
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_ignored_when_disabled() {
        let config = RateLimitConfig {
            respect_retry_after: false,
            ..Default::default()
        };
        let limiter = RateLimiter::from_config(&config).unwrap();
        limiter.set_retry_after(Duration::from_secs(30));

        let start = Instant::now();
        limiter.acquire(1.0).await.unwrap();
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_estimate() {
        let limiter = RateLimiter::new(2.0, 2.0).unwrap();
        assert_eq!(limiter.wait_time(1.0).await.unwrap(), Duration::ZERO);

        limiter.acquire(2.0).await.unwrap();
        assert_close(
            limiter.wait_time(1.0).await.unwrap(),
            Duration::from_millis(500),
        );

        limiter.set_retry_after(Duration::from_secs(5));
        assert!(limiter.wait_time(1.0).await.unwrap() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_rate() {
        let limiter = RateLimiter::new(10.0, 10.0).unwrap();
        assert_eq!(limiter.current_rate(), 0.0);

        limiter.acquire(1.0).await.unwrap();
        assert_eq!(limiter.current_rate(), 0.0);

        sleep(Duration::from_secs(1)).await;
        limiter.acquire(1.0).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        limiter.acquire(1.0).await.unwrap();

        // 3 requests spread over 2 seconds
        assert!((limiter.current_rate() - 1.5).abs() < 0.01);

        // Everything falls out of the 60s window
        sleep(Duration::from_secs(61)).await;
        assert_eq!(limiter.current_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_bucket_blocks_until_refill() {
        let limiter = RateLimiter::new(1.0, 1.0).unwrap();
        limiter.acquire(1.0).await.unwrap();

        let mut acquire = task::spawn(limiter.acquire(1.0));
        assert_pending!(acquire.poll());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_ready_ok!(acquire.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_consumes_nothing() {
        let limiter = RateLimiter::new(10.0, 10.0).unwrap();
        limiter.acquire(10.0).await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(100), limiter.acquire(5.0)).await;
        assert!(res.is_err());

        // 100ms of refill, nothing spent by the abandoned acquire
        let tokens = limiter.available_tokens().await;
        assert!((0.9..=1.1).contains(&tokens), "tokens = {}", tokens);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_capacity() {
        let limiter = RateLimiter::new(10.0, 1.0).unwrap();
        limiter.acquire(10.0).await.unwrap();
        limiter.set_retry_after(Duration::from_secs(60));

        limiter.reset().await;

        assert_eq!(limiter.available_tokens().await, 10.0);
        assert_eq!(limiter.totals().0, 0);
        let start = Instant::now();
        limiter.acquire(1.0).await.unwrap();
        assert_eq!(Instant::now(), start);
    }
}
