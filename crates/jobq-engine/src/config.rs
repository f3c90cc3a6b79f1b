use jobq_core::{BackoffPolicy, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Fallback wake-up period of the scheduler loop
    pub tick_interval_ms: u64,
    /// Pending jobs admitted before `submit` fails with QueueFull
    pub max_queue_size: usize,
    pub backoff: BackoffConfig,
    pub jobs: JobDefaults,
    /// Seed for the wait estimate until real attempt durations are observed
    pub per_job_estimate_secs: u64,
    /// Terminal records older than this are purged. `None` keeps them forever.
    pub retention_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub ceiling_ms: u64,
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            tick_interval_ms: 50,
            max_queue_size: 1000,
            backoff: BackoffConfig::default(),
            jobs: JobDefaults::default(),
            per_job_estimate_secs: 600,
            retention_secs: None,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_ms: 1000,
            ceiling_ms: 60_000,
            jitter: 0.0,
        }
    }
}

impl Default for JobDefaults {
    fn default() -> Self {
        JobDefaults {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl DispatcherConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff.base_ms),
            Duration::from_millis(self.backoff.ceiling_ms),
        )
        .with_jitter(self.backoff.jitter)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn per_job_estimate(&self) -> Duration {
        Duration::from_secs(self.per_job_estimate_secs)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.jobs.timeout_secs)
    }
}
