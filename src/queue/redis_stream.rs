//! Redis-Streams-with-consumer-groups backend.
//!
//! Key schema:
//!   - `procurator:queue:<name>`       stream of pending deliveries
//!   - `procurator:queue:<name>:dlq`  dead-letter stream
//!   - `procurator:task:<tid>`        task record hash, TTL 604800s
//!   - consumer group `procurator_group`, consumer `worker_<host>_<pid>`

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::cfg::Configuration;
use crate::core::types::{now_epoch, now_epoch_f64, TaskId, TaskRecord, TaskStatus};
use crate::error::{Error, Result};

use super::QueueBackend;

const GROUP_NAME: &str = "procurator_group";
const TASK_TTL_SECS: i64 = 604_800;

fn stream_key(queue: &str) -> String {
    format!("procurator:queue:{queue}")
}

fn dlq_key(queue: &str) -> String {
    format!("procurator:queue:{queue}:dlq")
}

fn task_key(tid: &TaskId) -> String {
    format!("procurator:task:{tid}")
}

pub struct RedisStreamBackend {
    client: ConnectionManager,
    consumer_name: String,
    cfg: Configuration,
    initialized_queues: Mutex<HashSet<String>>,
}

impl RedisStreamBackend {
    pub async fn connect(cfg: &Configuration) -> Result<Self> {
        let client = redis::Client::open(cfg.redis_url.as_str())?;
        let manager_cfg = redis::aio::ConnectionManagerConfig::new()
            .set_connection_timeout(cfg.redis_timeout())
            .set_response_timeout(cfg.redis_timeout());
        let manager = ConnectionManager::new_with_config(client, manager_cfg).await?;

        let hostname = hostname_for_consumer();
        let pid = std::process::id();
        info!("Redis pool initialized: {}", cfg.redis_url);

        Ok(RedisStreamBackend {
            client: manager,
            consumer_name: format!("worker_{hostname}_{pid}"),
            cfg: cfg.clone(),
            initialized_queues: Mutex::new(HashSet::new()),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.client.clone()
    }

    /// Direct handle used by `dlq.rs`, which operates on the DLQ stream
    /// without going through the `QueueBackend` trait.
    pub fn connection(&self) -> ConnectionManager {
        self.conn()
    }

    pub async fn ensure_group(&self, queue: &str) -> Result<()> {
        {
            let initialized = self.initialized_queues.lock().unwrap();
            if initialized.contains(queue) {
                return Ok(());
            }
        }

        let key = stream_key(queue);
        let mut conn = self.conn();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(&key, GROUP_NAME, "0").await;
        match result {
            Ok(()) => info!("created consumer group {GROUP_NAME} for {key}"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {}
            Err(e) => error!("failed to create consumer group for {key}: {e}"),
        }

        self.initialized_queues.lock().unwrap().insert(queue.to_string());
        Ok(())
    }

    async fn write_task_hash(&self, record: &TaskRecord) -> Result<()> {
        let key = task_key(&record.id);
        let payload_json = serde_json::to_string(&record.payload)?;
        let mut conn = self.conn();
        let fields: Vec<(&str, String)> = vec![
            ("id", record.id.to_string()),
            ("task", record.task.clone()),
            ("status", record.status.as_str().to_string()),
            ("created_at", record.created_at.to_string()),
            ("payload", payload_json),
            ("queue", record.queue.clone()),
            ("retries", record.retries.to_string()),
            ("max_retries", record.max_retries.to_string()),
        ];
        let _: () = conn.hset_multiple(&key, &fields).await?;
        let _: () = conn.expire(&key, TASK_TTL_SECS).await?;
        Ok(())
    }

    async fn read_task_record(&self, tid: &TaskId) -> Result<Option<TaskRecord>> {
        let key = task_key(tid);
        let mut conn = self.conn();
        let info: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
        if info.is_empty() {
            return Ok(None);
        }

        let payload: Value = info
            .get("payload")
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or(Value::Null);
        let status: TaskStatus = info
            .get("status")
            .map(String::as_str)
            .unwrap_or("pending")
            .parse()
            .unwrap_or(TaskStatus::Pending);

        let parse_i64 = |k: &str| info.get(k).and_then(|v| v.parse::<i64>().ok());
        let parse_u32 = |k: &str| info.get(k).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);

        Ok(Some(TaskRecord {
            id: tid.clone(),
            queue: info.get("queue").cloned().unwrap_or_default(),
            task: info.get("task").cloned().unwrap_or_else(|| "unknown".to_string()),
            status,
            payload,
            retries: parse_u32("retries"),
            max_retries: parse_u32("max_retries"),
            created_at: parse_i64("created_at").unwrap_or(0),
            updated_at: parse_i64("updated_at"),
            started_at: parse_i64("started_at"),
            finished_at: parse_i64("finished_at"),
            error: info.get("error").cloned(),
            worker_id: info.get("worker_id").cloned(),
            stream_msg_id: info.get("_stream_msg_id").cloned(),
        }))
    }

    /// Shared ack+status-update step behind `mark_done`/`mark_failed`.
    async fn ack_and_update(&self, tid: &TaskId, status: TaskStatus, error: Option<&str>) -> Result<()> {
        let key = task_key(tid);
        let mut conn = self.conn();

        let (queue, msg_id): (Option<String>, Option<String>) = {
            let mut pipe = redis::pipe();
            pipe.hget(&key, "queue").hget(&key, "_stream_msg_id");
            let (q, m): (Option<String>, Option<String>) = pipe.query_async(&mut conn).await?;
            (q, m)
        };

        let mut fields: Vec<(&str, String)> = vec![
            ("status", status.as_str().to_string()),
            ("updated_at", now_epoch().to_string()),
        ];
        if status.is_terminal() {
            fields.push(("finished_at", now_epoch().to_string()));
        }
        if let Some(err) = error {
            fields.push(("error", err.to_string()));
        }
        let _: () = conn.hset_multiple(&key, &fields).await?;

        if let (Some(queue), Some(msg_id)) = (queue, msg_id) {
            let stream = stream_key(&queue);
            let res: redis::RedisResult<i64> = conn.xack(&stream, GROUP_NAME, &[msg_id]).await;
            if let Err(e) = res {
                error!("failed to ACK task {tid}: {e}");
            }
        }

        Ok(())
    }

    /// Crash recovery sweep. Invoked probabilistically from `dequeue`, and
    /// callable directly.
    pub async fn process_pending(&self, queue: &str) -> Result<()> {
        self.ensure_group(queue).await?;
        let key = stream_key(queue);
        let mut conn = self.conn();

        let reply: redis::RedisResult<redis::streams::StreamPendingCountReply> = conn
            .xpending_count(
                &key,
                GROUP_NAME,
                "-",
                "+",
                self.cfg.sweep_sample_count as i64,
            )
            .await;

        let reply = match reply {
            Ok(r) => r,
            Err(e) => {
                error!("error processing pending for {queue}: {e}");
                return Ok(());
            }
        };

        for p in reply.ids {
            if p.times_delivered as u64 > self.cfg.poison_threshold {
                error!(
                    "message {} delivered {} times, dropping as poison",
                    p.id, p.times_delivered
                );
                let _: redis::RedisResult<i64> = conn.xack(&key, GROUP_NAME, &[&p.id]).await;
                continue;
            }

            if (p.last_delivered_ms as u128) > self.cfg.claim_idle().as_millis() {
                warn!("claiming timeout message {} in {queue}", p.id);
                let _: redis::RedisResult<redis::streams::StreamClaimReply> = conn
                    .xclaim(
                        &key,
                        GROUP_NAME,
                        &self.consumer_name,
                        self.cfg.claim_idle_ms as usize,
                        &[&p.id],
                    )
                    .await;
            }
        }

        Ok(())
    }
}

fn hostname_for_consumer() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[async_trait::async_trait]
impl QueueBackend for RedisStreamBackend {
    async fn enqueue(&self, queue: &str, payload: Value) -> Result<TaskId> {
        self.ensure_group(queue).await?;

        let record = TaskRecord::new(queue, payload, self.cfg.default_max_retries);
        let tid = record.id.clone();
        let task_name = record.task.clone();

        // Hash write precedes XADD so any consumer observing the stream
        // entry can always resolve the tid.
        self.write_task_hash(&record).await?;

        let key = stream_key(queue);
        let mut conn = self.conn();
        let _msg_id: String = conn.xadd(&key, "*", &[("tid", tid.to_string())]).await?;

        let depth: i64 = conn.xlen(&key).await.unwrap_or(0);
        counter!("procurator_task_enqueued_total", "queue" => queue.to_string(), "task_name" => task_name).increment(1);
        gauge!("procurator_task_queue_size", "queue" => queue.to_string()).set(depth as f64);

        Ok(tid)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<(TaskId, Value)>> {
        self.ensure_group(queue).await?;
        let key = stream_key(queue);

        if rand::thread_rng().gen_range(0..100) == 0 {
            if let Err(e) = self.process_pending(queue).await {
                error!("pending sweep failed for {queue}: {e}");
            }
        }

        let result = self.dequeue_inner(&key).await;
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                error!("Redis dequeue error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(None)
            }
        }
    }

    async fn mark_done(&self, tid: &TaskId) -> Result<()> {
        self.ack_and_update(tid, TaskStatus::Completed, None).await
    }

    async fn mark_failed(&self, tid: &TaskId, error: &str) -> Result<()> {
        let record = self.read_task_record(tid).await?;
        let Some(record) = record else {
            // Nothing to update; ensure we don't leave a dangling delivery.
            return self.ack_and_update(tid, TaskStatus::Dead, Some(error)).await;
        };

        if record.status == TaskStatus::Dead {
            // Already terminal; a double mark_failed must not write a
            // second DLQ entry.
            return Ok(());
        }

        if record.retries_exhausted() {
            if let Err(e) = self.write_dlq_entry(&record, error).await {
                error!("failed to move task {tid} to DLQ: {e}");
            }
            self.ack_and_update(tid, TaskStatus::Dead, Some(error)).await
        } else {
            self.ack_and_update(tid, TaskStatus::Failed, Some(error)).await
        }
    }

    async fn retry(&self, tid: &TaskId) -> Result<()> {
        let Some(record) = self.read_task_record(tid).await? else {
            return Err(Error::decode(format!("retry: no such task {tid}")));
        };
        if record.status != TaskStatus::Failed {
            return Ok(());
        }

        let key = task_key(tid);
        let mut conn = self.conn();
        let new_retries = record.retries + 1;
        let fields: Vec<(&str, String)> = vec![
            ("status", TaskStatus::Pending.as_str().to_string()),
            ("retries", new_retries.to_string()),
            ("updated_at", now_epoch().to_string()),
        ];
        let _: () = conn.hset_multiple(&key, &fields).await?;

        let stream = stream_key(&record.queue);
        let _msg_id: String = conn.xadd(&stream, "*", &[("tid", tid.to_string())]).await?;
        Ok(())
    }

    async fn get_task(&self, tid: &TaskId) -> Result<Option<TaskRecord>> {
        self.read_task_record(tid).await
    }
}

impl RedisStreamBackend {
    async fn dequeue_inner(&self, key: &str) -> Result<Option<(TaskId, Value)>> {
        let mut conn = self.conn();

        // 1. Own-pending drain: a crash-recovered delivery claimed back to
        // this consumer by a prior `process_pending` call.
        let own_opts = StreamReadOptions::default()
            .group(GROUP_NAME, &self.consumer_name)
            .count(1);
        let own: StreamReadReply = conn.xread_options(&[key], &["0"], &own_opts).await?;
        if let Some(entry) = first_entry(&own) {
            return self.resolve_delivery(key, entry).await;
        }

        // 2. New-message read, blocking up to the configured timeout.
        let new_opts = StreamReadOptions::default()
            .group(GROUP_NAME, &self.consumer_name)
            .count(1)
            .block(self.cfg.dequeue_block_ms as usize);
        let new: StreamReadReply = conn.xread_options(&[key], &[">"], &new_opts).await?;
        if let Some(entry) = first_entry(&new) {
            return self.resolve_delivery(key, entry).await;
        }

        Ok(None)
    }

    async fn resolve_delivery(
        &self,
        stream_key: &str,
        entry: StreamEntry,
    ) -> Result<Option<(TaskId, Value)>> {
        let tid = TaskId::from(entry.tid.clone());

        let key = task_key(&tid);
        let mut conn = self.conn();
        let fields: Vec<(&str, String)> = vec![
            ("_stream_msg_id", entry.msg_id.clone()),
            ("status", TaskStatus::Processing.as_str().to_string()),
            ("worker_id", self.consumer_name.clone()),
        ];
        let _: () = conn.hset_multiple(&key, &fields).await?;
        // started_at is set once, the first time this tid is delivered.
        let _: () = conn
            .hset_nx(&key, "started_at", now_epoch().to_string())
            .await?;

        match self.read_task_record(&tid).await? {
            Some(record) => Ok(Some((tid, record.payload))),
            None => {
                warn!("task {tid} found in stream but missing in hash");
                let mut conn = self.conn();
                let _: redis::RedisResult<i64> =
                    conn.xack(stream_key, GROUP_NAME, &[&entry.msg_id]).await;
                Ok(Some((tid, Value::Object(Default::default()))))
            }
        }
    }

    async fn write_dlq_entry(&self, record: &TaskRecord, error: &str) -> Result<()> {
        let key = dlq_key(&record.queue);
        let payload_str = serde_json::to_string(&record.payload)?;
        let mut conn = self.conn();
        // died_at is a string-of-float epoch seconds, matching the
        // original's `str(time.time())`, not whole-seconds like the other
        // timestamps in this schema.
        let fields: Vec<(&str, String)> = vec![
            ("tid", record.id.to_string()),
            ("task", record.task.clone()),
            ("error", error.to_string()),
            ("died_at", now_epoch_f64().to_string()),
            ("original_payload", payload_str),
        ];
        let _msg_id: String = conn.xadd(&key, "*", &fields).await?;
        warn!("task {} moved to DLQ: {key}", record.id);
        Ok(())
    }
}

struct StreamEntry {
    msg_id: String,
    tid: String,
}

/// Pulls the single `(msg_id, tid)` pair out of a one-stream, one-entry
/// `XREADGROUP` reply.
fn first_entry(reply: &StreamReadReply) -> Option<StreamEntry> {
    let stream = reply.keys.first()?;
    let entry = stream.ids.first()?;
    let tid = entry
        .map
        .get("tid")
        .and_then(|v| match v {
            redis::Value::BulkString(b) => String::from_utf8(b.clone()).ok(),
            redis::Value::SimpleString(s) => Some(s.clone()),
            _ => None,
        })?;
    Some(StreamEntry {
        msg_id: entry.id.clone(),
        tid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::streams::{StreamId, StreamKey};
    use std::collections::HashMap;

    #[test]
    fn key_schema_is_stable() {
        assert_eq!(stream_key("api"), "procurator:queue:api");
        assert_eq!(dlq_key("api"), "procurator:queue:api:dlq");
        assert_eq!(task_key(&TaskId::from("abc")), "procurator:task:abc");
    }

    #[test]
    fn first_entry_extracts_tid_from_a_populated_reply() {
        let mut map = HashMap::new();
        map.insert(
            "tid".to_string(),
            redis::Value::BulkString(b"11111111-1111-1111-1111-111111111111".to_vec()),
        );
        let reply = StreamReadReply {
            keys: vec![StreamKey {
                key: "procurator:queue:api".to_string(),
                ids: vec![StreamId {
                    id: "1700000000000-0".to_string(),
                    map,
                }],
            }],
        };

        let entry = first_entry(&reply).expect("entry present");
        assert_eq!(entry.msg_id, "1700000000000-0");
        assert_eq!(entry.tid, "11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn first_entry_is_none_for_an_empty_reply() {
        let reply = StreamReadReply { keys: vec![] };
        assert!(first_entry(&reply).is_none());
    }
}

/// Scenarios from spec.md §8 that need a real consumer-group stream to
/// exercise (crash recovery, poison drop, DLQ round-trip). These require a
/// live Redis reachable at `REDIS_URL` (default `redis://127.0.0.1:6379/15`)
/// and are `#[ignore]`d so a plain `cargo test` doesn't need one; run them
/// explicitly with `cargo test -- --ignored`.
#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;

    async fn test_backend(configure: impl FnOnce(&mut Configuration)) -> RedisStreamBackend {
        let mut cfg = Configuration {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string()),
            ..Configuration::default()
        };
        configure(&mut cfg);
        RedisStreamBackend::connect(&cfg)
            .await
            .expect("a live Redis is required for this ignored test")
    }

    fn unique_queue(prefix: &str) -> String {
        format!("{prefix}_{}", TaskId::new())
    }

    #[tokio::test]
    #[ignore = "requires a live Redis server"]
    async fn poison_message_is_dropped_without_a_dlq_write() {
        let backend = test_backend(|cfg| cfg.poison_threshold = 2).await;
        let queue = unique_queue("poison");
        backend.enqueue(&queue, json!({"task": "t"})).await.unwrap();

        // Redeliver the same entry past the poison threshold without acking.
        for _ in 0..3 {
            backend.dequeue(&queue).await.unwrap();
        }
        backend.process_pending(&queue).await.unwrap();

        let mut conn = backend.connection();
        let pending: redis::streams::StreamPendingCountReply = conn
            .xpending_count(&stream_key(&queue), GROUP_NAME, "-", "+", 10)
            .await
            .unwrap();
        assert!(pending.ids.is_empty(), "poison entry should have been ack'd");

        let dlq: Vec<(String, std::collections::HashMap<String, String>)> =
            conn.xrange(&dlq_key(&queue), "-", "+").await.unwrap();
        assert!(dlq.is_empty(), "poison drop must not write a DLQ entry");
    }

    #[tokio::test]
    #[ignore = "requires a live Redis server"]
    async fn crash_recovery_claims_and_redelivers_idle_entries() {
        let backend = test_backend(|cfg| cfg.claim_idle_ms = 0).await;
        let queue = unique_queue("crash");
        let tid = backend
            .enqueue(&queue, json!({"task": "_doc_example"}))
            .await
            .unwrap();

        // Consumer A receives the delivery and crashes without acking.
        let (first_tid, _payload) = backend.dequeue(&queue).await.unwrap().unwrap();
        assert_eq!(first_tid, tid);

        // claim_idle_ms == 0 means the entry is already idle enough for the
        // next sweep to reclaim it for this same consumer.
        backend.process_pending(&queue).await.unwrap();

        // The own-pending drain (step 2 of dequeue) now redelivers it.
        let (second_tid, payload) = backend.dequeue(&queue).await.unwrap().unwrap();
        assert_eq!(second_tid, tid);
        assert_eq!(payload["task"], "_doc_example");

        backend.mark_done(&tid).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a live Redis server"]
    async fn dlq_round_trip_through_list_inspect_and_replay() {
        let backend = std::sync::Arc::new(test_backend(|_| {}).await);
        let dlq = crate::dlq::DlqAdmin::new(backend.clone());
        let queue = unique_queue("dlq");

        let payload = json!({"task": "t", "data": 42});
        let tid = backend.enqueue(&queue, payload.clone()).await.unwrap();
        backend.dequeue(&queue).await.unwrap();
        backend.mark_failed(&tid, "boom").await.unwrap();

        let record = backend.get_task(&tid).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Dead);

        let listed = dlq.list(&queue, 20).await.unwrap();
        let entry = listed.iter().find(|e| e.task == "t").expect("dead letter listed");

        let detail = dlq.inspect(&queue, &entry.msg_id).await.unwrap();
        assert_eq!(detail.payload, Some(payload.clone()));

        let outcome = dlq.replay(&queue, &entry.msg_id).await.unwrap();
        assert_ne!(outcome.new_tid, tid.to_string());

        let replayed = backend
            .get_task(&TaskId::from(outcome.new_tid))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replayed.payload, payload);
    }
}
