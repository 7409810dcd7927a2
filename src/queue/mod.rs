//! Durable per-stage message channels with at-least-once delivery.
//!
//! Each pipeline stage has its own ordered queue. Dequeue moves a message to
//! a processing list; it leaves the system only via [`StageQueue::ack`],
//! [`StageQueue::requeue`] (attempt incremented), or
//! [`StageQueue::dead_letter`] (payload preserved with the terminal error,
//! never silently dropped).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::models::message::{PipelineMessage, Stage};

pub mod memory;
pub mod redis;

pub use memory::MemoryStageQueue;
pub use redis::RedisStageQueue;

/// A message that exhausted its retry budget or failed permanently, held
/// for manual inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: PipelineMessage,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: PipelineMessage, error: impl Into<String>) -> Self {
        Self {
            message,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Storage contract for the per-stage queues.
#[async_trait]
pub trait StageQueue: Send + Sync {
    /// Append a message to its stage's pending queue.
    async fn enqueue(&self, msg: &PipelineMessage) -> Result<(), QueueError>;

    /// Pop the next pending message for `stage`, moving it to the
    /// processing list. Returns `None` when the queue is empty.
    async fn dequeue(&self, stage: Stage) -> Result<Option<PipelineMessage>, QueueError>;

    /// Remove a processed message from the processing list.
    async fn ack(&self, msg: &PipelineMessage) -> Result<(), QueueError>;

    /// Put a failed message back on its pending queue with `attempt_count`
    /// incremented, removing the original from the processing list.
    async fn requeue(&self, msg: &PipelineMessage) -> Result<(), QueueError>;

    /// Move a message to the stage's dead-letter queue with its terminal
    /// error, removing it from the processing list.
    async fn dead_letter(&self, msg: &PipelineMessage, error: &str) -> Result<(), QueueError>;

    /// Number of pending messages for `stage` (used for backpressure and
    /// the queue-depth gauge).
    async fn depth(&self, stage: Stage) -> Result<u64, QueueError>;

    /// Move messages stranded on the processing list back to pending,
    /// returning how many were recovered. A crash between dequeue and
    /// ack leaves its in-flight messages there; running this at startup
    /// keeps at-least-once delivery honest across process deaths.
    async fn recover(&self, stage: Stage) -> Result<u64, QueueError>;

    /// Dead-lettered messages for `stage`, oldest first.
    async fn dead_letters(&self, stage: Stage) -> Result<Vec<DeadLetter>, QueueError>;
}
