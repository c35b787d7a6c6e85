//! End-to-end scenarios against the Memory backend: happy-path completion,
//! retry-then-dead-letter, and FIFO ordering. Scenarios that require a live
//! Redis server (crash recovery, poison drop, DLQ round-trip) are covered by
//! the `#[ignore]`d integration tests in `queue::redis_stream`'s
//! `integration_tests` module instead — run them with
//! `cargo test -- --ignored` against a reachable `REDIS_URL`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use procurator::cfg::Configuration;
use procurator::core::dispatch::{Dispatch, DispatchRegistry};
use procurator::core::hooks::NoopHooks;
use procurator::core::types::TaskStatus;
use procurator::error::{Error, Result};
use procurator::queue::QueueManager;
use procurator::webhook::WebhookNotifier;
use procurator::worker::{WorkerContext, WorkerPool};
use serde_json::{json, Value};

struct AlwaysFails;

#[async_trait]
impl Dispatch for AlwaysFails {
    async fn call(&self, _task_data: Value) -> Result<Value> {
        Err(Error::dispatch("boom"))
    }
}

fn registry() -> Arc<DispatchRegistry> {
    let mut registry = procurator::core::dispatch::default_registry();
    registry.register("always_fails", Arc::new(AlwaysFails));
    Arc::new(registry)
}

fn test_ctx(registry: Arc<DispatchRegistry>) -> (QueueManager, WorkerContext) {
    let cfg = Arc::new(Configuration::default());
    let queue_manager = QueueManager::memory();
    let ctx = WorkerContext {
        queue_manager: queue_manager.clone(),
        registry,
        hooks: Arc::new(NoopHooks),
        webhook: Arc::new(WebhookNotifier::new(&cfg)),
        cfg,
    };
    (queue_manager, ctx)
}

async fn wait_for_terminal(qm: &QueueManager, tid: &procurator::core::types::TaskId) -> TaskStatus {
    for _ in 0..200 {
        if let Ok(Some(record)) = qm.get_task(tid).await {
            if record.status.is_terminal() {
                return record.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {tid} never reached a terminal status");
}

#[tokio::test]
async fn happy_path_completes_and_records_finish_time() {
    let (qm, ctx) = test_ctx(registry());
    let pool = WorkerPool::spawn(&["api".to_string()], ctx);

    let tid = qm.enqueue("api", json!({"task": "_doc_example", "taskData": {}})).await.unwrap();
    let status = wait_for_terminal(&qm, &tid).await;

    assert_eq!(status, TaskStatus::Completed);
    let record = qm.get_task(&tid).await.unwrap().unwrap();
    assert!(record.finished_at.is_some());

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn retry_budget_exhaustion_moves_task_to_dead() {
    let (qm, ctx) = test_ctx(registry());
    let pool = WorkerPool::spawn(&["api".to_string()], ctx);

    let tid = qm
        .enqueue("api", json!({"task": "always_fails", "_max_retries": 2}))
        .await
        .unwrap();
    let status = wait_for_terminal(&qm, &tid).await;

    assert_eq!(status, TaskStatus::Dead);
    let record = qm.get_task(&tid).await.unwrap().unwrap();
    assert_eq!(record.retries, 2);
    assert_eq!(record.error.as_deref(), Some("task dispatch failed: boom"));

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn memory_backend_preserves_fifo_order() {
    let qm = QueueManager::memory();
    let mut tids = Vec::new();
    for i in 0..3 {
        let tid = qm.enqueue("api", json!({"task": "_doc_example", "n": i})).await.unwrap();
        tids.push(tid);
    }
    for expected in tids {
        let (tid, _payload) = qm.dequeue("api").await.unwrap().unwrap();
        assert_eq!(tid, expected);
    }
    assert!(qm.dequeue("api").await.unwrap().is_none());
}
