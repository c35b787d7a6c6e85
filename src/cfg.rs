//! Process configuration, loaded once at startup from the environment.
//!
//! Collapses a hand-rolled, hot-reloaded `.env`-merged config into one
//! typed, validated struct. Hot-reload is deliberately not carried over:
//! every value here is read once and handed to long-lived components (the
//! queue backend, the worker pool) at construction time.

use std::time::Duration;

use serde::Deserialize;

fn default_queue_backend() -> QueueBackendKind {
    QueueBackendKind::Memory
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    3_000
}

fn default_max_retries() -> u32 {
    0
}

fn default_dequeue_block_ms() -> u64 {
    2_000
}

fn default_claim_idle_ms() -> u64 {
    600_000
}

fn default_poison_threshold() -> u64 {
    10
}

fn default_sweep_sample_count() -> usize {
    10
}

fn default_worker_idle_sleep_ms() -> u64 {
    500
}

fn default_webhook_timeout_secs() -> u64 {
    5
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    Memory,
    Redis,
}

/// Typed, env-sourced configuration. Deserialized with `envy`, which maps
/// `SCREAMING_SNAKE_CASE` environment variables onto these (lower_snake)
/// field names automatically.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_queue_backend")]
    pub queue_backend: QueueBackendKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_dequeue_block_ms")]
    pub dequeue_block_ms: u64,

    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    #[serde(default = "default_poison_threshold")]
    pub poison_threshold: u64,

    #[serde(default = "default_sweep_sample_count")]
    pub sweep_sample_count: usize,

    #[serde(default = "default_worker_idle_sleep_ms")]
    pub worker_idle_sleep_ms: u64,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            queue_backend: default_queue_backend(),
            redis_url: default_redis_url(),
            redis_timeout_ms: default_redis_timeout_ms(),
            default_max_retries: default_max_retries(),
            dequeue_block_ms: default_dequeue_block_ms(),
            claim_idle_ms: default_claim_idle_ms(),
            poison_threshold: default_poison_threshold(),
            sweep_sample_count: default_sweep_sample_count(),
            worker_idle_sleep_ms: default_worker_idle_sleep_ms(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
            http_addr: default_http_addr(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Configuration {
    /// Loads configuration from the process environment, falling back to
    /// defaults for anything unset. Prefixed variables look like
    /// `QUEUE_BACKEND=redis`, `REDIS_URL=redis://...`, etc.
    pub fn from_env() -> crate::error::Result<Self> {
        match envy::from_env::<Configuration>() {
            Ok(cfg) => Ok(cfg),
            Err(e) => Err(crate::error::Error::Config(e.to_string())),
        }
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn dequeue_block(&self) -> Duration {
        Duration::from_millis(self.dequeue_block_ms)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    pub fn worker_idle_sleep(&self) -> Duration {
        Duration::from_millis(self.worker_idle_sleep_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Configuration::default();
        assert_eq!(cfg.queue_backend, QueueBackendKind::Memory);
        assert_eq!(cfg.claim_idle_ms, 600_000);
        assert_eq!(cfg.poison_threshold, 10);
    }
}
