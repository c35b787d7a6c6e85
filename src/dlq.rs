//! DLQ administration: list, inspect, replay, purge.
//!
//! Operates directly on the Redis DLQ stream rather than through the
//! `QueueBackend` trait — these are operator actions on dead letters, not
//! task lifecycle transitions. Only meaningful for the Stream backend;
//! there is no DLQ on Memory.

use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::queue::redis_stream::RedisStreamBackend;

fn dlq_key(queue: &str) -> String {
    format!("procurator:queue:{queue}:dlq")
}

fn format_died_at(timestamp: f64) -> String {
    chrono::DateTime::from_timestamp(timestamp as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterSummary {
    pub msg_id: String,
    /// `died_at` formatted as `%Y-%m-%d %H:%M:%S`, matching the original's
    /// `datetime.fromtimestamp(ts).strftime(...)`.
    pub time: String,
    pub timestamp: f64,
    pub task: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterDetail {
    pub msg_id: String,
    pub meta: std::collections::HashMap<String, String>,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub new_tid: String,
}

pub struct DlqAdmin {
    backend: std::sync::Arc<RedisStreamBackend>,
}

impl DlqAdmin {
    pub fn new(backend: std::sync::Arc<RedisStreamBackend>) -> Self {
        DlqAdmin { backend }
    }

    /// Most recent `count` dead letters, newest first (`XREVRANGE`).
    pub async fn list(&self, queue: &str, count: usize) -> Result<Vec<DeadLetterSummary>> {
        let key = dlq_key(queue);
        let mut conn = self.backend.connection();
        let entries: Vec<(String, std::collections::HashMap<String, String>)> =
            conn.xrevrange_count(&key, "+", "-", count).await?;

        Ok(entries
            .into_iter()
            .map(|(msg_id, body)| {
                let timestamp: f64 = body.get("died_at").and_then(|v| v.parse().ok()).unwrap_or(0.0);
                DeadLetterSummary {
                    msg_id,
                    time: format_died_at(timestamp),
                    timestamp,
                    task: body.get("task").cloned().unwrap_or_else(|| "unknown".to_string()),
                    error: body.get("error").cloned().unwrap_or_else(|| "unknown".to_string()),
                }
            })
            .collect())
    }

    /// Full detail for one dead letter, including the decoded original
    /// payload when present.
    pub async fn inspect(&self, queue: &str, msg_id: &str) -> Result<DeadLetterDetail> {
        let (_, body) = self.fetch_entry(queue, msg_id).await?;

        // JSON-parse the original payload; if it doesn't parse, fall back
        // to the raw string rather than dropping it, matching the
        // original's `except: result["payload"] = body["original_payload"]`.
        let payload = body.get("original_payload").map(|raw| {
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        });

        Ok(DeadLetterDetail {
            msg_id: msg_id.to_string(),
            meta: body,
            payload,
        })
    }

    /// Re-enqueues the dead letter's original payload under a fresh tid.
    /// The DLQ entry itself is left in place as a historical record.
    pub async fn replay(&self, queue: &str, msg_id: &str) -> Result<ReplayOutcome> {
        let (_, body) = self.fetch_entry(queue, msg_id).await?;

        let payload_str = body
            .get("original_payload")
            .ok_or_else(|| Error::decode(format!("dead letter {msg_id} has no original_payload")))?;
        let payload: Value = serde_json::from_str(payload_str)?;

        let tid = {
            use crate::queue::QueueBackend;
            self.backend.enqueue(queue, payload).await?
        };

        Ok(ReplayOutcome {
            new_tid: tid.to_string(),
        })
    }

    /// Drops every dead letter in `queue`'s DLQ (`XTRIM MAXLEN 0`).
    pub async fn purge(&self, queue: &str) -> Result<()> {
        let key = dlq_key(queue);
        let mut conn = self.backend.connection();
        let _: i64 = conn
            .xtrim(&key, redis::streams::StreamMaxlen::Equals(0))
            .await?;
        warn!("purged DLQ {key}");
        Ok(())
    }

    async fn fetch_entry(
        &self,
        queue: &str,
        msg_id: &str,
    ) -> Result<(String, std::collections::HashMap<String, String>)> {
        let key = dlq_key(queue);
        let mut conn = self.backend.connection();
        let entries: Vec<(String, std::collections::HashMap<String, String>)> =
            conn.xrange(&key, msg_id, msg_id).await?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::decode(format!("dead letter {msg_id} not found in {key}")))
    }
}
