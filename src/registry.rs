//! Handler registry: resolves a method name to a callable and its policy.
//!
//! Registration is a static table built once at startup. The engine only
//! sees the [`HandlerRegistry`] trait, so hosts can plug in their own
//! lookup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::scheduler::Policy;

/// Boxed future produced by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

/// A callable bound to one method.
///
/// Implemented for any `Fn(Value, CancellationToken) -> impl Future`.
/// Handlers should poll the token at await points; the scheduler aborts
/// the task anyway once the token fires.
pub trait Handler: Send + Sync {
    fn call(&self, params: Value, token: CancellationToken) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    fn call(&self, params: Value, token: CancellationToken) -> HandlerFuture {
        Box::pin(self(params, token))
    }
}

/// Resolved handler with its declared concurrency policy.
pub struct HandlerDescriptor {
    pub method: String,
    pub policy: Policy,
    handler: Arc<dyn Handler>,
}

impl HandlerDescriptor {
    pub fn new(method: impl Into<String>, policy: Policy, handler: impl Handler + 'static) -> Self {
        Self {
            method: method.into(),
            policy,
            handler: Arc::new(handler),
        }
    }

    pub fn invoke(&self, params: Value, token: CancellationToken) -> HandlerFuture {
        self.handler.call(params, token)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("method", &self.method)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Lookup from method name to handler.
pub trait HandlerRegistry: Send + Sync {
    fn resolve(&self, method: &str) -> Option<Arc<HandlerDescriptor>>;
}

/// Static registration table.
#[derive(Debug, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<HandlerDescriptor>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `method`.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        policy: Policy,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        let descriptor = HandlerDescriptor::new(method, policy, handler);
        if let Some(previous) = self
            .handlers
            .insert(descriptor.method.clone(), Arc::new(descriptor))
        {
            log::debug!(
                target: "dapwire::registry",
                "Replaced handler for {}",
                previous.method
            );
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(
        mut self,
        method: impl Into<String>,
        policy: Policy,
        handler: impl Handler + 'static,
    ) -> Self {
        self.register(method, policy, handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl HandlerRegistry for HandlerTable {
    fn resolve(&self, method: &str) -> Option<Arc<HandlerDescriptor>> {
        self.handlers.get(method).cloned()
    }
}

/// Decode handler parameters, reporting failures as `InvalidParameters`.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_parameters(e.to_string()))
}
