use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use uuid::Uuid;

/// 引擎配置
/// Passed by value into the engine at construction; there is no global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Lock owner written on acquired jobs.
    pub worker_id: String,
    /// Attempts a job gets before it is dead-lettered.
    pub job_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub lock_duration_ms: u64,
    pub acquire_batch_size: usize,
    pub poll_interval_ms: u64,
    /// Upper bound of agenda operations per command (guards against cycles without wait states).
    pub max_agenda_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            job_retries: 3,
            retry_backoff_ms: 10_000,
            retry_backoff_max_ms: 600_000,
            lock_duration_ms: 300_000,
            acquire_batch_size: 10,
            poll_interval_ms: 1_000,
            max_agenda_steps: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_file(file_path: &str) -> Result<Self> {
        let content = fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read config file from {}", file_path))?;
        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to deserialize config from {}", file_path))?;
        Ok(config)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before the given failed attempt (1-based) is retried: `base * 2^(attempt-1)`, capped.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.retry_backoff_max_ms))
    }
}
