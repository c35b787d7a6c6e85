//! In-process backend. A single mutex-protected store: a map from tid to
//! record, and a map from queue name to a FIFO list of tids. `dequeue`
//! pops the head and returns immediately if the list is empty — there is
//! no redelivery, since a delivery is implicitly acknowledged by the pop
//! itself. Suitable only for single-process development: a crashed
//! consumer simply loses whatever it had dequeued.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use metrics::{counter, gauge};
use serde_json::Value;

use crate::core::types::{now_epoch, TaskId, TaskRecord, TaskStatus};
use crate::error::{Error, Result};

use super::QueueBackend;

struct Store {
    tasks: HashMap<TaskId, TaskRecord>,
    queues: HashMap<String, VecDeque<TaskId>>,
}

pub struct MemoryBackend {
    store: Mutex<Store>,
    /// Used when a payload carries no `_max_retries` of its own; mirrors
    /// the Stream backend's `cfg.default_max_retries` (spec.md §3:
    /// "max_retries: ... from payload or config default").
    default_max_retries: u32,
}

impl MemoryBackend {
    pub fn new(default_max_retries: u32) -> Self {
        MemoryBackend {
            store: Mutex::new(Store {
                tasks: HashMap::new(),
                queues: HashMap::new(),
            }),
            default_max_retries,
        }
    }

    fn push(store: &mut Store, queue: &str, tid: TaskId) {
        store
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(tid);
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(&self, queue: &str, payload: Value) -> Result<TaskId> {
        let record = TaskRecord::new(queue, payload, self.default_max_retries);
        let tid = record.id.clone();
        let task_name = record.task.clone();

        let mut store = self.store.lock().unwrap();
        store.tasks.insert(tid.clone(), record);
        Self::push(&mut store, queue, tid.clone());
        let depth = store.queues.get(queue).map(|q| q.len()).unwrap_or(0);
        drop(store);

        counter!("procurator_task_enqueued_total", "queue" => queue.to_string(), "task_name" => task_name).increment(1);
        gauge!("procurator_task_queue_size", "queue" => queue.to_string()).set(depth as f64);

        Ok(tid)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<(TaskId, Value)>> {
        let mut store = self.store.lock().unwrap();
        let Some(tid) = store.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        let depth = store.queues.get(queue).map(|q| q.len()).unwrap_or(0);
        let payload = store.tasks.get_mut(&tid).map(|r| {
            r.status = TaskStatus::Processing;
            r.started_at.get_or_insert_with(now_epoch);
            r.payload.clone()
        });
        drop(store);

        gauge!("procurator_task_queue_size", "queue" => queue.to_string()).set(depth as f64);

        Ok(payload.map(|p| (tid, p)))
    }

    async fn mark_done(&self, tid: &TaskId) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(record) = store.tasks.get_mut(tid) {
            record.status = TaskStatus::Completed;
            record.updated_at = Some(now_epoch());
            record.finished_at = Some(now_epoch());
        }
        Ok(())
    }

    async fn mark_failed(&self, tid: &TaskId, error: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(record) = store.tasks.get_mut(tid) {
            record.error = Some(error.to_string());
            record.updated_at = Some(now_epoch());
            if record.retries_exhausted() {
                record.status = TaskStatus::Dead;
                record.finished_at = Some(now_epoch());
            } else {
                record.status = TaskStatus::Failed;
            }
        }
        Ok(())
    }

    async fn retry(&self, tid: &TaskId) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let queue = match store.tasks.get_mut(tid) {
            Some(record) if record.status == TaskStatus::Failed => {
                record.retries += 1;
                record.status = TaskStatus::Pending;
                record.updated_at = Some(now_epoch());
                record.queue.clone()
            }
            Some(_) => return Ok(()),
            None => {
                return Err(Error::decode(format!("retry: no such task {tid}")));
            }
        };
        Self::push(&mut store, &queue, tid.clone());
        Ok(())
    }

    async fn get_task(&self, tid: &TaskId) -> Result<Option<TaskRecord>> {
        let store = self.store.lock().unwrap();
        Ok(store.tasks.get(tid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fifo_order_within_a_queue() {
        let backend = MemoryBackend::new(0);
        let mut tids = Vec::new();
        for i in 0..3 {
            let tid = backend
                .enqueue("api", json!({"task": "t", "n": i}))
                .await
                .unwrap();
            tids.push(tid);
        }
        for expected in tids {
            let (tid, _payload) = backend.dequeue("api").await.unwrap().unwrap();
            assert_eq!(tid, expected);
        }
        assert!(backend.dequeue("api").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn happy_path_round_trip() {
        let backend = MemoryBackend::new(0);
        let tid = backend
            .enqueue("api", json!({"task": "_doc_example"}))
            .await
            .unwrap();
        let (got_tid, _payload) = backend.dequeue("api").await.unwrap().unwrap();
        assert_eq!(got_tid, tid);
        backend.mark_done(&tid).await.unwrap();
        let record = backend.get_task(&tid).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn failure_without_retry_budget_goes_dead() {
        let backend = MemoryBackend::new(0);
        let tid = backend
            .enqueue("api", json!({"task": "t", "_max_retries": 0}))
            .await
            .unwrap();
        backend.dequeue("api").await.unwrap();
        backend.mark_failed(&tid, "boom").await.unwrap();
        let record = backend.get_task(&tid).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Dead);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn retry_then_dead_respects_max_retries() {
        let backend = MemoryBackend::new(0);
        let tid = backend
            .enqueue("api", json!({"task": "t", "_max_retries": 2}))
            .await
            .unwrap();

        for attempt in 0..3 {
            let (got_tid, _payload) = backend.dequeue("api").await.unwrap().unwrap();
            assert_eq!(got_tid, tid);
            backend.mark_failed(&tid, "boom").await.unwrap();
            let record = backend.get_task(&tid).await.unwrap().unwrap();
            if attempt < 2 {
                assert_eq!(record.status, TaskStatus::Failed);
                backend.retry(&tid).await.unwrap();
            } else {
                assert_eq!(record.status, TaskStatus::Dead);
            }
        }

        let record = backend.get_task(&tid).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Dead);
        assert_eq!(record.retries, 2);
    }
}
