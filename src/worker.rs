//! The worker pool: one long-running consumer loop per queue.
//!
//! Each loop is: dequeue, sleep and retry if nothing is waiting, run the
//! lifecycle hooks and dispatch around the task, update the record, retry
//! or finalize, and fire the webhook if the outcome is terminal. Shutdown
//! is cooperative — a `CancellationToken` is checked between iterations
//! and given a bounded grace period to let an in-flight dispatch finish.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cfg::Configuration;
use crate::core::dispatch::DispatchRegistry;
use crate::core::hooks::LifecycleHooks;
use crate::core::types::{read_reserved_fields, TaskId, TaskStatus};
use crate::error::Error;
use crate::metrics;
use crate::queue::QueueManager;
use crate::webhook::WebhookNotifier;

/// Shared dependencies every per-queue loop needs; cloned cheaply into each
/// spawned task.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue_manager: QueueManager,
    pub registry: Arc<DispatchRegistry>,
    pub hooks: Arc<dyn LifecycleHooks>,
    pub webhook: Arc<WebhookNotifier>,
    pub cfg: Arc<Configuration>,
}

/// Owns the spawned per-queue tasks and the token used to stop them.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawns one consumer loop per entry in `queues`, sharing `ctx`.
    pub fn spawn(queues: &[String], ctx: WorkerContext) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(queues.len());

        for queue in queues {
            let queue = queue.clone();
            let ctx = ctx.clone();
            let token = cancel.clone();
            let worker_id = worker_id();
            handles.push(tokio::spawn(async move {
                run_queue_loop(queue, ctx, token, worker_id).await;
            }));
        }

        WorkerPool { handles, cancel }
    }

    /// Signals every loop to stop, then waits up to `cfg.shutdown_grace`
    /// for them to drain their current iteration.
    pub async fn shutdown(self, grace: std::time::Duration) {
        self.cancel.cancel();
        let join_all = futures::future::join_all(self.handles);
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!("worker pool did not shut down within the grace period");
        }
    }
}

fn worker_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    format!("worker_{hostname}_{}", std::process::id())
}

async fn run_queue_loop(
    queue: String,
    ctx: WorkerContext,
    cancel: CancellationToken,
    worker_id: String,
) {
    info!("worker {worker_id} starting loop for queue {queue}");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let dequeued = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = ctx.queue_manager.dequeue(&queue) => Some(res),
        };

        let Some(dequeued) = dequeued else {
            break;
        };

        match dequeued {
            Ok(Some((tid, payload))) => {
                process_one(&queue, &ctx, &worker_id, tid, payload).await;
            }
            Ok(None) => {
                tokio::time::sleep(ctx.cfg.worker_idle_sleep()).await;
            }
            Err(e) => {
                error!("dequeue error on queue {queue}: {e}");
                tokio::time::sleep(ctx.cfg.worker_idle_sleep()).await;
            }
        }
    }

    info!("worker {worker_id} stopped loop for queue {queue}");
}

async fn process_one(queue: &str, ctx: &WorkerContext, worker_id: &str, tid: TaskId, payload: Value) {
    let reserved = read_reserved_fields(&payload);
    let task_name = reserved.task.clone();

    // on_init fires once per tid from QueueManager::enqueue, not here —
    // this runs on every delivery, including redelivered retries.
    ctx.hooks.on_start(&tid, worker_id).await;
    metrics::record_started(queue, &task_name);

    let started = Instant::now();
    let outcome = ctx.registry.call(&task_name, reserved.task_data.clone()).await;
    metrics::record_execution_time(queue, &task_name, started.elapsed());

    match outcome {
        Ok(result) => {
            if let Err(e) = ctx.queue_manager.mark_done(&tid).await {
                error!("failed to mark task {tid} done: {e}");
            }
            metrics::record_finished(queue, &task_name);

            ctx.hooks
                .on_finish(&tid, TaskStatus::Completed, Some(&result), None, worker_id)
                .await;

            notify_if_webhook(ctx, &reserved.webhook, &tid, &task_name, "done", Some(&result), None, reserved.meta.as_ref())
                .await;
        }
        Err(e) => {
            handle_failure(queue, ctx, worker_id, tid, &task_name, e, reserved.webhook, reserved.meta)
                .await;
        }
    }
}

async fn handle_failure(
    queue: &str,
    ctx: &WorkerContext,
    worker_id: &str,
    tid: TaskId,
    task_name: &str,
    err: Error,
    webhook: Option<String>,
    meta: Option<Value>,
) {
    let message = err.to_string();
    metrics::record_failed(queue, task_name, err.typ().as_str());

    if let Err(e) = ctx.queue_manager.mark_failed(&tid, &message).await {
        error!("failed to mark task {tid} failed: {e}");
    }

    let status = ctx.queue_manager.status(&tid).await;
    let final_status: TaskStatus = status.parse().unwrap_or(TaskStatus::Dead);

    if final_status == TaskStatus::Failed {
        // Retry budget remains: re-enqueue the same tid for another
        // delivery (failed -> pending).
        if let Err(e) = ctx.queue_manager.retry(&tid).await {
            error!("failed to requeue task {tid} for retry: {e}");
        }
        return;
    }

    ctx.hooks
        .on_finish(&tid, final_status, None, Some(&message), worker_id)
        .await;

    notify_if_webhook(ctx, &webhook, &tid, task_name, "failed", None, Some(&message), meta.as_ref()).await;
}

#[allow(clippy::too_many_arguments)]
async fn notify_if_webhook(
    ctx: &WorkerContext,
    webhook: &Option<String>,
    tid: &TaskId,
    task_name: &str,
    status: &str,
    result: Option<&Value>,
    error: Option<&str>,
    meta: Option<&Value>,
) {
    if let Some(url) = webhook {
        ctx.webhook
            .notify(url, tid, task_name, status, result, error, meta)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::default_registry;
    use crate::core::hooks::NoopHooks;
    use serde_json::json;

    fn test_ctx() -> WorkerContext {
        WorkerContext {
            queue_manager: QueueManager::memory(),
            registry: Arc::new(default_registry()),
            hooks: Arc::new(NoopHooks),
            webhook: Arc::new(WebhookNotifier::new(&Configuration::default())),
            cfg: Arc::new(Configuration::default()),
        }
    }

    #[tokio::test]
    async fn happy_path_marks_task_completed() {
        let ctx = test_ctx();
        let tid = ctx
            .queue_manager
            .enqueue("api", json!({"task": "_doc_example"}))
            .await
            .unwrap();
        let (got_tid, payload) = ctx.queue_manager.dequeue("api").await.unwrap().unwrap();
        assert_eq!(got_tid, tid);

        process_one("api", &ctx, "worker_test", tid.clone(), payload).await;

        let record = ctx.queue_manager.get_task(&tid).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_task_retries_until_dead() {
        let ctx = test_ctx();
        let tid = ctx
            .queue_manager
            .enqueue("api", json!({"task": "no_such_task", "_max_retries": 1}))
            .await
            .unwrap();

        for _ in 0..2 {
            let (got_tid, payload) = ctx.queue_manager.dequeue("api").await.unwrap().unwrap();
            assert_eq!(got_tid, tid);
            process_one("api", &ctx, "worker_test", tid.clone(), payload).await;
        }

        let record = ctx.queue_manager.get_task(&tid).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Dead);
        assert_eq!(record.retries, 1);
    }
}
