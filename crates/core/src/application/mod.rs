// Application Layer - Outbound call governance

pub mod governor;
pub mod rate_limit;
pub mod retry;

// Re-exports
pub use governor::RequestGovernor;
pub use rate_limit::{AdaptiveRateLimiter, LimiterStats, RateLimiter};
pub use retry::{RetryDecision, RetryHandler};
