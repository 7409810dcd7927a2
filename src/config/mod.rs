use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::runner::RunnerConfig;
use crate::scheduler::{BackoffPolicy, SchedulerConfig};

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Admin/metrics bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the stage queues
    pub redis_url: String,

    /// Configured jobs, in scheduling order (comma-separated in the env)
    #[serde(default)]
    pub jobs: Vec<String>,

    /// Delay between a finished job and its successor
    #[serde(default = "default_fast_retry_secs")]
    pub fast_retry_secs: u64,

    /// Delay when the scheduler wraps back to the first job
    #[serde(default = "default_full_cycle_secs")]
    pub full_cycle_secs: u64,

    /// Retry budget for messages and for consecutive extract failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consumer concurrency per CPU/DB-bound stage
    #[serde(default = "default_transform_concurrency")]
    pub transform_concurrency: usize,

    #[serde(default = "default_load_concurrency")]
    pub load_concurrency: usize,

    #[serde(default = "default_vectorize_concurrency")]
    pub vectorize_concurrency: usize,

    /// Downstream queue depth above which upstream consumption pauses
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: u64,

    /// In-run extract backoff curve for transient failures
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Longer backoff curve used when the upstream rate-limits
    #[serde(default = "default_rate_limit_backoff_base_ms")]
    pub rate_limit_backoff_base_ms: u64,

    #[serde(default = "default_rate_limit_backoff_cap_ms")]
    pub rate_limit_backoff_cap_ms: u64,

    /// Reschedule backoff base for a job that failed transiently
    #[serde(default = "default_retry_backoff_base_secs")]
    pub retry_backoff_base_secs: u64,

    /// TTL on Redis queue keys
    #[serde(default = "default_queue_ttl_secs")]
    pub queue_ttl_secs: u64,

    /// Idle poll interval for stage consumers
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Postgres pool ceiling
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_fast_retry_secs() -> u64 {
    15 * 60
}

fn default_full_cycle_secs() -> u64 {
    60 * 60
}

fn default_max_retries() -> u32 {
    3
}

fn default_transform_concurrency() -> usize {
    4
}

fn default_load_concurrency() -> usize {
    4
}

fn default_vectorize_concurrency() -> usize {
    2
}

fn default_backpressure_threshold() -> u64 {
    500
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_rate_limit_backoff_base_ms() -> u64 {
    5_000
}

fn default_rate_limit_backoff_cap_ms() -> u64 {
    300_000
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_retry_backoff_base_secs() -> u64 {
    30
}

fn default_queue_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_retries: self.max_retries,
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_cap_ms),
            ),
            rate_limit_backoff: BackoffPolicy::new(
                Duration::from_millis(self.rate_limit_backoff_base_ms),
                Duration::from_millis(self.rate_limit_backoff_cap_ms),
            ),
            transform_concurrency: self.transform_concurrency,
            load_concurrency: self.load_concurrency,
            vectorize_concurrency: self.vectorize_concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            backpressure_threshold: self.backpressure_threshold,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            fast_retry: Duration::from_secs(self.fast_retry_secs),
            full_cycle: Duration::from_secs(self.full_cycle_secs),
            max_retries: self.max_retries,
            retry_backoff: BackoffPolicy::new(
                Duration::from_secs(self.retry_backoff_base_secs),
                Duration::from_secs(self.fast_retry_secs),
            ),
            tick_interval: Duration::from_secs(1),
        }
    }
}
