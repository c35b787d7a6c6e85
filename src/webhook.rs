//! Best-effort webhook notification on task completion.
//!
//! A single POST with a short timeout; failures are logged and never
//! propagated into the delivery outcome, the same "fire and forget"
//! contract as the lifecycle hooks.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::cfg::Configuration;
use crate::core::types::TaskId;

#[derive(Serialize)]
struct WebhookBody<'a> {
    task_id: &'a str,
    task: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a Value>,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(cfg: &Configuration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(cfg.webhook_timeout())
            .build()
            .unwrap_or_default();
        WebhookNotifier { client }
    }

    /// Posts the outcome to `url`. `status` is the webhook-wire status —
    /// literally `"done"` or `"failed"`, independent of the task's own
    /// `TaskStatus` (which may be `completed`, `failed`, or `dead`) — per
    /// the original's `notify(tid, task, payload, "done"|"failed", ...)`.
    /// Logs on failure (non-2xx response or transport error) and returns
    /// regardless — the worker loop never waits on this beyond the
    /// client's own timeout.
    #[tracing::instrument(skip(self, result, meta), fields(tid = %tid))]
    pub async fn notify(
        &self,
        url: &str,
        tid: &TaskId,
        task: &str,
        status: &str,
        result: Option<&Value>,
        error: Option<&str>,
        meta: Option<&Value>,
    ) {
        let tid_str = tid.to_string();
        let body = WebhookBody {
            task_id: &tid_str,
            task,
            status,
            result,
            error,
            meta,
        };

        let res = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match res {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!("webhook {url} for task {tid} returned status {}", resp.status());
            }
            Err(e) => {
                warn!("webhook {url} for task {tid} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_omits_absent_fields() {
        let body = WebhookBody {
            task_id: "t1",
            task: "_doc_example",
            status: "completed",
            result: None,
            error: None,
            meta: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("meta").is_none());
        assert_eq!(json["status"], "completed");
    }
}
