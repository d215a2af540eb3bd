// Central Error Type and Retry Classification

use std::time::Duration;
use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{}", rate_limited_message(.retry_after))]
    RateLimited { retry_after: Option<u64> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn rate_limited_message(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!("Rate limit exceeded. Retry after {} seconds", secs),
        None => "Rate limit exceeded".to_string(),
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Map an HTTP status returned by the remote service onto the error taxonomy.
    ///
    /// `retry_after` is the raw `Retry-After` header value, if any. Only the
    /// delay-seconds form is understood; anything else is ignored.
    pub fn from_status(status: u16, retry_after: Option<&str>, body: impl Into<String>) -> Self {
        match status {
            401 => AppError::Authentication("Invalid API key or unauthorized access".to_string()),
            404 => AppError::NotFound(body.into()),
            429 => AppError::RateLimited {
                retry_after: retry_after.and_then(|v| v.trim().parse().ok()),
            },
            s if s >= 500 => AppError::Network(format!("Server error: {}", s)),
            s => AppError::Api {
                status: s,
                message: body.into(),
            },
        }
    }
}

/// Retry classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The service is throttling us, optionally with a suggested delay
    RateLimited { retry_after: Option<Duration> },
    /// Connection or timeout failure, assumed recoverable
    Transient,
    /// Validation, auth, not-found and the like; never retried
    Terminal,
    /// Unexpected failure inside our own code; never retried
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimited { .. } | ErrorKind::Transient)
    }
}

/// Errors that can tell the retry machinery what kind of failure they are
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for AppError {
    fn kind(&self) -> ErrorKind {
        match self {
            AppError::RateLimited { retry_after } => ErrorKind::RateLimited {
                retry_after: retry_after.map(Duration::from_secs),
            },
            AppError::Network(_) | AppError::Timeout(_) | AppError::Io(_) => ErrorKind::Transient,
            AppError::Api { status, .. } if *status >= 500 => ErrorKind::Transient,
            AppError::Internal(_) => ErrorKind::Internal,
            _ => ErrorKind::Terminal,
        }
    }
}
