use serde::{Deserialize, Serialize};

use crate::config::BackoffConfig;

/// Settings of one task worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Attempts per task before it is dropped.
    pub max_attempts: u32,
    /// Delay between attempts of a retryable task.
    pub retry: BackoffConfig,
    /// Pause after a failed dequeue, in milliseconds.
    pub idle_backoff_ms: u64,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_idle_backoff(mut self, ms: u64) -> Self {
        self.idle_backoff_ms = ms;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "default-worker".to_string(),
            max_attempts: 3,
            retry: BackoffConfig::default(),
            idle_backoff_ms: 100,
        }
    }
}
