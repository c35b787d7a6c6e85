//! Lifecycle hook contract: `onInit`, `onStart`, `onFinish`.
//!
//! The core invokes these but does not own their implementation — a
//! deployment might use them to write bookkeeping rows into an external
//! store, which is out of scope for this crate. All three are best-effort:
//! a failing hook is logged and swallowed, never propagated into the
//! delivery outcome.

use async_trait::async_trait;
use serde_json::Value;

use crate::core::types::{TaskId, TaskStatus};

#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_init(&self, tid: &TaskId, queue: &str, task: &str, payload: &Value);

    async fn on_start(&self, tid: &TaskId, worker_id: &str);

    async fn on_finish(
        &self,
        tid: &TaskId,
        status: TaskStatus,
        result: Option<&Value>,
        error: Option<&str>,
        worker_id: &str,
    );
}

/// Default no-op implementation for binaries/tests that don't persist
/// task history anywhere.
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {
    async fn on_init(&self, _tid: &TaskId, _queue: &str, _task: &str, _payload: &Value) {}
    async fn on_start(&self, _tid: &TaskId, _worker_id: &str) {}
    async fn on_finish(
        &self,
        _tid: &TaskId,
        _status: TaskStatus,
        _result: Option<&Value>,
        _error: Option<&str>,
        _worker_id: &str,
    ) {
    }
}
