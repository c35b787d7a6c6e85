//! Queue backend contract and the manager façade that picks a concrete
//! implementation by configuration.
//!
//! A small trait implemented by each backend, and a façade that wraps
//! whichever backend was selected plus the lifecycle-hooks sink: `enqueue`
//! calls `on_init` exactly once per tid, right after the backend confirms
//! the write, so every enqueue call site (the HTTP `/dispatch` handler, the
//! `dlq replay` path) gets it for free without threading hooks through each
//! one individually.

pub mod memory;
pub mod redis_stream;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};

use crate::cfg::{Configuration, QueueBackendKind};
use crate::core::hooks::{LifecycleHooks, NoopHooks};
use crate::core::types::{read_reserved_fields, TaskId, TaskRecord};
use crate::error::Result;

use memory::MemoryBackend;
use redis_stream::RedisStreamBackend;

/// The operations every queue backend must provide. All take/return plain
/// values; storage errors are surfaced to the caller rather than hidden.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Generates a fresh tid, persists a `pending` record, and makes the
    /// task visible to future `dequeue` calls on `queue`.
    async fn enqueue(&self, queue: &str, payload: Value) -> Result<TaskId>;

    /// Blocks for an implementation-defined upper bound (~2s on the Stream
    /// backend, immediate on Memory) and returns `None` on timeout. After
    /// returning `Some`, the delivery is outstanding until `mark_done` or
    /// `mark_failed` is called with the same tid.
    async fn dequeue(&self, queue: &str) -> Result<Option<(TaskId, Value)>>;

    /// Transitions the record to `completed` and acknowledges the
    /// delivery. Idempotent: a second call is a no-op.
    async fn mark_done(&self, tid: &TaskId) -> Result<()>;

    /// Acknowledges the delivery and transitions the record to `failed`
    /// (if a retry remains) or `dead` with a DLQ entry written (if the
    /// retry budget is exhausted) — see DESIGN.md for how the retry/DLQ
    /// split was resolved.
    async fn mark_failed(&self, tid: &TaskId, error: &str) -> Result<()>;

    /// `failed -> pending`: increments `retries` and publishes a fresh
    /// delivery for the same tid, preserving the original payload and
    /// `max_retries`. Only valid to call when `mark_failed` left the
    /// record in `failed` (not `dead`) status.
    async fn retry(&self, tid: &TaskId) -> Result<()>;

    /// Returns the current record, or `None` if it has expired/never
    /// existed.
    async fn get_task(&self, tid: &TaskId) -> Result<Option<TaskRecord>>;
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<MemoryBackend>),
    Redis(Arc<RedisStreamBackend>),
}

/// Thin façade selecting a backend by configuration; exposes the same
/// contract plus `status`, and owns the `LifecycleHooks` sink so `on_init`
/// fires exactly once per enqueued tid regardless of caller.
#[derive(Clone)]
pub struct QueueManager {
    backend: Backend,
    hooks: Arc<dyn LifecycleHooks>,
}

impl QueueManager {
    /// Constructs the backend named by `cfg.queue_backend`. On Redis
    /// construction failure, falls back to Memory and logs a warning
    /// rather than failing startup.
    pub async fn new(cfg: &Configuration, hooks: Arc<dyn LifecycleHooks>) -> Self {
        let backend = match cfg.queue_backend {
            QueueBackendKind::Memory => {
                tracing::info!("using MemoryBackend");
                Backend::Memory(Arc::new(MemoryBackend::new(cfg.default_max_retries)))
            }
            QueueBackendKind::Redis => match RedisStreamBackend::connect(cfg).await {
                Ok(backend) => {
                    tracing::info!("using RedisStreamBackend");
                    Backend::Redis(Arc::new(backend))
                }
                Err(e) => {
                    warn!("failed to init Redis backend: {e}, falling back to Memory");
                    Backend::Memory(Arc::new(MemoryBackend::new(cfg.default_max_retries)))
                }
            },
        };
        QueueManager { backend, hooks }
    }

    /// A Memory-backed manager with no-op hooks, for tests and demos that
    /// don't need external bookkeeping.
    pub fn memory() -> Self {
        QueueManager {
            backend: Backend::Memory(Arc::new(MemoryBackend::new(0))),
            hooks: Arc::new(NoopHooks),
        }
    }

    pub async fn enqueue(&self, queue: &str, payload: Value) -> Result<TaskId> {
        let task_name = read_reserved_fields(&payload).task;
        let payload_for_hook = payload.clone();

        let tid = match &self.backend {
            Backend::Memory(b) => b.enqueue(queue, payload).await,
            Backend::Redis(b) => b.enqueue(queue, payload).await,
        }?;

        self.hooks.on_init(&tid, queue, &task_name, &payload_for_hook).await;
        Ok(tid)
    }

    pub async fn dequeue(&self, queue: &str) -> Result<Option<(TaskId, Value)>> {
        match &self.backend {
            Backend::Memory(b) => b.dequeue(queue).await,
            Backend::Redis(b) => b.dequeue(queue).await,
        }
    }

    pub async fn mark_done(&self, tid: &TaskId) -> Result<()> {
        match &self.backend {
            Backend::Memory(b) => b.mark_done(tid).await,
            Backend::Redis(b) => b.mark_done(tid).await,
        }
    }

    pub async fn mark_failed(&self, tid: &TaskId, error: &str) -> Result<()> {
        match &self.backend {
            Backend::Memory(b) => b.mark_failed(tid, error).await,
            Backend::Redis(b) => b.mark_failed(tid, error).await,
        }
    }

    pub async fn retry(&self, tid: &TaskId) -> Result<()> {
        match &self.backend {
            Backend::Memory(b) => b.retry(tid).await,
            Backend::Redis(b) => b.retry(tid).await,
        }
    }

    pub async fn get_task(&self, tid: &TaskId) -> Result<Option<TaskRecord>> {
        match &self.backend {
            Backend::Memory(b) => b.get_task(tid).await,
            Backend::Redis(b) => b.get_task(tid).await,
        }
    }

    /// `status(tid) -> string`; `"unknown"` once the record has expired.
    pub async fn status(&self, tid: &TaskId) -> String {
        match self.get_task(tid).await {
            Ok(Some(record)) => record.status.to_string(),
            Ok(None) => "unknown".to_string(),
            Err(e) => {
                error!("status lookup failed for {tid}: {e}");
                "unknown".to_string()
            }
        }
    }

    /// Only meaningful for the Stream backend; used by `dlq.rs` to get at
    /// the shared Redis connection for DLQ stream operations that the
    /// `QueueBackend` trait doesn't expose.
    pub fn redis(&self) -> Option<Arc<RedisStreamBackend>> {
        match &self.backend {
            Backend::Redis(b) => Some(b.clone()),
            Backend::Memory(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingHooks {
        init_calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LifecycleHooks for CountingHooks {
        async fn on_init(&self, tid: &TaskId, _queue: &str, _task: &str, _payload: &Value) {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(tid.to_string());
        }
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

    #[tokio::test]
    async fn on_init_fires_exactly_once_per_enqueue() {
        let hooks = Arc::new(CountingHooks::default());
        let qm = QueueManager {
            backend: Backend::Memory(Arc::new(MemoryBackend::new(0))),
            hooks: hooks.clone(),
        };

        let tid = qm.enqueue("api", json!({"task": "_doc_example"})).await.unwrap();

        assert_eq!(hooks.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.seen.lock().unwrap().as_slice(), &[tid.to_string()]);

        // Dequeuing (a delivery, not an enqueue) must not trigger on_init
        // again — it fires once per tid, not once per delivery.
        qm.dequeue("api").await.unwrap();
        assert_eq!(hooks.init_calls.load(Ordering::SeqCst), 1);
    }
}
