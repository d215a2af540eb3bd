//! RPC Error Types
//!
//! Error objects carried in response envelopes, plus the reserved codes the
//! transport itself produces.

use flowline_core::AppError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved JSON-RPC error codes
///
/// Handlers should use application-defined codes outside this range.
pub mod code {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// `error` member of a response envelope
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("RPC error ({code}): {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(code::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL_ERROR, message)
    }
}

/// Convert AppError to an internal-error object carrying the failure text
pub fn to_rpc_error(err: AppError) -> RpcError {
    RpcError::internal(err.to_string())
}

impl From<AppError> for RpcError {
    fn from(err: AppError) -> Self {
        to_rpc_error(err)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        to_rpc_error(AppError::Serialization(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_becomes_internal_error() {
        let err: RpcError = AppError::Timeout("list nodes".to_string()).into();
        assert_eq!(err.code, code::INTERNAL_ERROR);
        assert_eq!(err.message, "Timeout: list nodes");
    }

    #[test]
    fn test_method_not_found_message() {
        let err = RpcError::method_not_found("tools/frobnicate");
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found: tools/frobnicate");
    }
}
