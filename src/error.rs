//! Error taxonomy for the engine.
//!
//! Collaborator failures are classified once, at the stage boundary, into
//! [`StageError`]; everything above the workers deals in that classification
//! and never re-inspects raw errors. Store and queue backends keep their own
//! error types so a Redis outage is distinguishable from a Postgres one.

use thiserror::Error;

/// Classified failure from a stage collaborator. The classification decides
/// the retry policy: rate limits and transient faults are retried with
/// backoff, permanent faults go straight to the dead-letter queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Failure from the job table or checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("unknown job: {0}")]
    UnknownJob(String),
}

/// Failure from the stage queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Engine-level failure: infrastructure went wrong mid-run. Folded into a
/// resumable job failure by the runner, never surfaced to the scheduler.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("stage failure: {0}")]
    Stage(#[from] StageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_transients_are_retryable() {
        assert!(StageError::RateLimited("quota".into()).is_retryable());
        assert!(StageError::Transient("timeout".into()).is_retryable());
        assert!(!StageError::Permanent("bad schema".into()).is_retryable());
    }

    #[test]
    fn only_rate_limits_report_as_rate_limits() {
        assert!(StageError::RateLimited("quota".into()).is_rate_limit());
        assert!(!StageError::Transient("timeout".into()).is_rate_limit());
    }

    #[test]
    fn stage_error_display_carries_the_reason() {
        let err = StageError::Permanent("record missing external_id".to_string());
        assert_eq!(err.to_string(), "permanent failure: record missing external_id");
    }
}
