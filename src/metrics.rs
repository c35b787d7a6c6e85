//! Prometheus metrics for the broker.
//!
//! ## Series
//!
//! - `procurator_task_enqueued_total{queue,task_name}` - counter
//! - `procurator_task_queue_size{queue}` - gauge
//! - `procurator_task_started_total{queue,task_name}` - counter
//! - `procurator_task_finished_total{queue,task_name}` - counter
//! - `procurator_task_failed_total{queue,task_name,error_type}` - counter
//! - `procurator_task_execution_seconds{queue,task_name}` - histogram
//!
//! `enqueued_total` and `queue_size` are emitted directly by the queue
//! backends (`queue::memory`, `queue::redis_stream`); the rest are emitted
//! by the worker loop via the helpers below.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const TASK_ENQUEUED: &str = "procurator_task_enqueued_total";
    pub const QUEUE_SIZE: &str = "procurator_task_queue_size";
    pub const TASK_STARTED: &str = "procurator_task_started_total";
    pub const TASK_FINISHED: &str = "procurator_task_finished_total";
    pub const TASK_FAILED: &str = "procurator_task_failed_total";
    pub const TASK_EXECUTION_SECONDS: &str = "procurator_task_execution_seconds";
}

/// Histogram buckets for `procurator_task_execution_seconds`, in seconds.
const EXECUTION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Installs the global Prometheus recorder and registers the execution
/// histogram's buckets. Call once at startup, before any worker spawns.
pub fn install() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .set_buckets_for_metric(
                    metrics_exporter_prometheus::Matcher::Full(
                        names::TASK_EXECUTION_SECONDS.to_string(),
                    ),
                    EXECUTION_BUCKETS,
                )
                .expect("valid histogram buckets")
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

pub fn handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

pub fn record_started(queue: &str, task_name: &str) {
    counter!(names::TASK_STARTED, "queue" => queue.to_string(), "task_name" => task_name.to_string())
        .increment(1);
}

pub fn record_finished(queue: &str, task_name: &str) {
    counter!(names::TASK_FINISHED, "queue" => queue.to_string(), "task_name" => task_name.to_string())
        .increment(1);
}

pub fn record_failed(queue: &str, task_name: &str, error_type: &str) {
    counter!(
        names::TASK_FAILED,
        "queue" => queue.to_string(),
        "task_name" => task_name.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

pub fn record_execution_time(queue: &str, task_name: &str, elapsed: Duration) {
    histogram!(
        names::TASK_EXECUTION_SECONDS,
        "queue" => queue.to_string(),
        "task_name" => task_name.to_string()
    )
    .record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_buckets_are_the_expected_scale() {
        assert_eq!(
            EXECUTION_BUCKETS,
            &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
        );
    }
}
