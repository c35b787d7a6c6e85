//! Shared domain types: task identity, status, and the task record itself.
//!
//! Payloads are kept as raw `serde_json::Value` end to end — the core
//! never shapes them into a typed schema, it only reaches into the four
//! reserved keys (`task`, `taskData`, `webhook`, `_max_retries`).

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque task identifier. A fresh one is minted by `enqueue`; callers
/// treat it as an opaque string everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

/// The task state machine.
///
/// `Pending -> Processing -> {Completed, Failed}`; `Failed` may re-enter
/// `Pending` (retry) or transition to `Dead` (retries exhausted).
/// `Completed` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead" => Ok(TaskStatus::Dead),
            other => Err(crate::error::Error::Decode(format!(
                "unknown task status `{other}`"
            ))),
        }
    }
}

/// The reserved keys the core is allowed to read out of an otherwise
/// opaque payload. Everything else in the JSON object passes through
/// untouched to `Dispatch`.
pub struct ReservedFields {
    pub task: String,
    pub task_data: Value,
    pub webhook: Option<String>,
    pub max_retries: Option<u32>,
    pub meta: Option<Value>,
}

pub fn read_reserved_fields(payload: &Value) -> ReservedFields {
    let task = payload
        .get("task")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let task_data = payload.get("taskData").cloned().unwrap_or(Value::Null);
    let webhook = payload
        .get("webhook")
        .and_then(Value::as_str)
        .map(str::to_string);
    let max_retries = payload.get("_max_retries").and_then(Value::as_u64).map(|v| v as u32);
    let meta = payload.get("meta").cloned();

    ReservedFields {
        task,
        task_data,
        webhook,
        max_retries,
        meta,
    }
}

/// A task record as exposed by `get_task`. Field names and epoch-seconds
/// timestamps match the Redis hash schema exactly, so a record round-trips
/// onto it without renaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub queue: String,
    pub task: String,
    pub status: TaskStatus,
    pub payload: Value,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    /// Stream backend only: the delivery this record's current attempt is
    /// bound to. Required to ACK or claim. `None` on the Memory backend.
    #[serde(default)]
    pub stream_msg_id: Option<String>,
}

impl TaskRecord {
    pub fn new(queue: impl Into<String>, payload: Value, default_max_retries: u32) -> Self {
        let reserved = read_reserved_fields(&payload);
        TaskRecord {
            id: TaskId::new(),
            queue: queue.into(),
            task: reserved.task,
            status: TaskStatus::Pending,
            payload,
            retries: 0,
            max_retries: reserved.max_retries.unwrap_or(default_max_retries),
            created_at: now_epoch(),
            updated_at: None,
            started_at: None,
            finished_at: None,
            error: None,
            worker_id: None,
            stream_msg_id: None,
        }
    }

    /// True once this tid has exhausted its retry budget on a failed
    /// attempt. `retries` never exceeds `max_retries`, so once this is
    /// true the next failure moves the task to `Dead` rather than retrying.
    pub fn retries_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }
}

pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Fractional-seconds epoch, matching the original's `str(time.time())`.
/// Used only where the wire schema calls for a float timestamp (the DLQ
/// `died_at` field); everywhere else timestamps are whole epoch seconds.
pub fn now_epoch_f64() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_fields_defaults_when_absent() {
        let payload = json!({});
        let fields = read_reserved_fields(&payload);
        assert_eq!(fields.task, "unknown");
        assert_eq!(fields.task_data, Value::Null);
        assert!(fields.webhook.is_none());
        assert!(fields.max_retries.is_none());
    }

    #[test]
    fn reserved_fields_extracted() {
        let payload = json!({
            "task": "_doc_example",
            "taskData": {"x": 1},
            "webhook": "https://example.com/hook",
            "_max_retries": 3,
        });
        let fields = read_reserved_fields(&payload);
        assert_eq!(fields.task, "_doc_example");
        assert_eq!(fields.task_data, json!({"x": 1}));
        assert_eq!(fields.webhook.as_deref(), Some("https://example.com/hook"));
        assert_eq!(fields.max_retries, Some(3));
    }

    #[test]
    fn task_record_inherits_reserved_max_retries() {
        let payload = json!({"task": "t", "_max_retries": 5});
        let record = TaskRecord::new("api", payload, 0);
        assert_eq!(record.max_retries, 5);
        assert_eq!(record.retries, 0);
        assert!(!record.retries_exhausted());
    }

    #[test]
    fn task_status_round_trips_through_str() {
        for s in ["pending", "processing", "completed", "failed", "dead"] {
            let st: TaskStatus = s.parse().unwrap();
            assert_eq!(st.as_str(), s);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }
}
