//! RPC Method Handlers
//!
//! Method name -> handler registry consulted by the dispatch loop.

use crate::error::RpcError;
use crate::types::Params;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Handles one inbound method
///
/// Errors are sent back to the peer as they are; use application-defined
/// codes, or let `AppError`s convert into internal errors with `?`.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn call(&self, params: Params) -> Result<Value, RpcError>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn call(&self, params: Params) -> Result<Value, RpcError> {
        (self)(params).await
    }
}

/// Shared handler table
///
/// Clones share the same table. Registration is synchronized with lookups,
/// so registering while the dispatch loop runs is safe.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn MethodHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any previous one
    pub fn register(&self, method: impl Into<String>, handler: impl MethodHandler) {
        let method = method.into();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.clone(), Arc::new(handler))
            .is_some();

        debug!(method = %method, replaced = replaced, "Registered handler");
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }
}
