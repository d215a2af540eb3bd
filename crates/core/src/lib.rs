// Flowline Core - Rate limiting, retry and request governance
// NO transport or logging setup here, only timers and locks

pub mod application;
pub mod config;
pub mod error;

pub use application::{AdaptiveRateLimiter, LimiterStats, RateLimiter, RequestGovernor, RetryHandler};
pub use config::{RateLimitConfig, RetryConfig};
pub use error::{AppError, Classify, ErrorKind, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
