//! The `Dispatch` capability contract and the string-keyed registry that
//! resolves a task name to an implementation.
//!
//! Specific task implementations (HTTP fan-out, token fetching, sandboxed
//! sub-process execution) are out of scope for this crate, but the seam
//! they plug into, and a couple of demo dispatchers needed to exercise a
//! happy-path scenario end to end, live here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// Whether a task may, must, or must never be executed synchronously
/// from the dispatch endpoint rather than queued for worker pickup.
/// Modeled as a real three-variant enum rather than a hardcoded constant;
/// see DESIGN.md for how the ambiguity was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// The submitter may request either synchronous or queued execution.
    Free,
    /// The task must be executed synchronously; enqueueing it is rejected.
    Must,
    /// The task must never be executed synchronously; only enqueueing is
    /// permitted.
    Prohibited,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Free
    }
}

/// `Dispatch(task_name, task_data) -> result | error` — the single
/// suspension-capable call in the worker loop.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn call(&self, task_data: Value) -> Result<Value>;

    /// Defaults to `Free`; a dispatcher may override this to declare a
    /// stricter contract.
    fn sync_mode(&self) -> SyncMode {
        SyncMode::Free
    }
}

/// `task_name -> handler` registry populated at startup and queried by
/// name at dispatch time.
#[derive(Clone, Default)]
pub struct DispatchRegistry {
    handlers: HashMap<String, Arc<dyn Dispatch>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Dispatch>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn sync_mode(&self, task_name: &str) -> SyncMode {
        self.handlers
            .get(task_name)
            .map(|h| h.sync_mode())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub async fn call(&self, task_name: &str, task_data: Value) -> Result<Value> {
        match self.handlers.get(task_name) {
            Some(handler) => handler.call(task_data).await,
            None => Err(Error::dispatch(format!(
                "task handler not found: {task_name}"
            ))),
        }
    }
}

/// Demo dispatcher used to exercise the happy path end to end: always
/// succeeds, returning a fixed greeting.
pub struct DocExample;

#[async_trait]
impl Dispatch for DocExample {
    async fn call(&self, _task_data: Value) -> Result<Value> {
        Ok(Value::String("Hello World".to_string()))
    }
}

/// Demo liveness-check dispatcher.
pub struct Ping;

#[async_trait]
impl Dispatch for Ping {
    async fn call(&self, _task_data: Value) -> Result<Value> {
        Ok(serde_json::json!({"pong": true}))
    }
}

/// Builds the registry shipped by default: the two demo dispatchers. Real
/// deployments construct their own registry and register production task
/// implementations before handing it to the worker pool.
pub fn default_registry() -> DispatchRegistry {
    let mut registry = DispatchRegistry::new();
    registry.register("_doc_example", Arc::new(DocExample));
    registry.register("system.ping", Arc::new(Ping));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn doc_example_returns_hello_world() {
        let registry = default_registry();
        let result = registry.call("_doc_example", Value::Null).await.unwrap();
        assert_eq!(result, Value::String("Hello World".to_string()));
    }

    #[tokio::test]
    async fn unknown_task_is_a_dispatch_error() {
        let registry = default_registry();
        let err = registry.call("no_such_task", Value::Null).await.unwrap_err();
        assert_eq!(err.typ(), crate::error::ErrorType::Dispatch);
    }

    #[test]
    fn default_sync_mode_is_free() {
        let registry = default_registry();
        assert_eq!(registry.sync_mode("_doc_example"), SyncMode::Free);
        assert_eq!(registry.sync_mode("unregistered"), SyncMode::Free);
    }
}
