//! Collaborator contracts for the four pipeline stages.
//!
//! The engine owns scheduling, queues, checkpoints, and retries; the actual
//! extraction/transform/load/vectorize logic is supplied per job type
//! through these traits. Collaborators report failures as classified
//! [`StageError`]s; the runner never sees anything unclassified.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::checkpoint::NestedCursor;
use crate::error::StageError;
use crate::models::message::{PipelineMessage, Stage};

pub mod runner;
pub mod worker;

pub use runner::{JobOutcome, JobRunner};
pub use worker::{StageWorker, WorkerConfig};

/// Bounded batch of raw records pulled from an upstream source, plus the
/// cursor to resume from and whether the source is exhausted.
#[derive(Debug, Clone)]
pub struct ExtractBatch {
    pub records: Vec<Value>,
    pub cursor: NestedCursor,
    pub exhausted: bool,
}

/// Extraction collaborator: pulls one bounded batch at the given cursor.
///
/// Rate limiting must surface as [`StageError::RateLimited`] so the runner
/// can apply a rate-limit-specific backoff instead of the generic one.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        job_name: &str,
        cursor: NestedCursor,
    ) -> Result<ExtractBatch, StageError>;
}

/// A record that failed validation inside an otherwise good batch. It is
/// dead-lettered individually; the rest of the batch proceeds.
#[derive(Debug, Clone)]
pub struct RejectedRecord {
    pub record: Value,
    pub error: String,
}

/// Result of processing one message in a transform/load/vectorize stage.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Records to forward to the next stage's queue.
    pub records: Vec<Value>,
    /// Invalid records, each dead-lettered with its own error.
    pub rejected: Vec<RejectedRecord>,
}

impl StageOutput {
    pub fn forward(records: Vec<Value>) -> Self {
        Self { records, rejected: Vec::new() }
    }
}

/// Transform/Load/Vectorize collaborator: pure function over one message.
///
/// Load implementations must upsert by external ID, which is what makes
/// checkpoint replay idempotent.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn process(&self, msg: &PipelineMessage) -> Result<StageOutput, StageError>;
}

/// Re-validation hook for the external resource a job syncs against (e.g.
/// an integration record). Checked before dispatch and between batches so a
/// permanently deactivated integration cannot deadlock the scheduler.
#[async_trait]
pub trait IntegrationGate: Send + Sync {
    async fn is_active(&self, job_name: &str) -> bool;
}

/// Gate for jobs with no external activation state.
pub struct AlwaysActive;

#[async_trait]
impl IntegrationGate for AlwaysActive {
    async fn is_active(&self, _job_name: &str) -> bool {
        true
    }
}

/// The four collaborators for one job type.
pub struct JobPipeline {
    pub extractor: Arc<dyn Extractor>,
    pub transform: Arc<dyn StageHandler>,
    pub load: Arc<dyn StageHandler>,
    pub vectorize: Arc<dyn StageHandler>,
}

impl JobPipeline {
    /// Handler for a consuming stage. Extract is driven by the runner's
    /// cursor loop, not by a queue consumer, so it has no handler here.
    pub fn handler(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        match stage {
            Stage::Extract => None,
            Stage::Transform => Some(self.transform.clone()),
            Stage::Load => Some(self.load.clone()),
            Stage::Vectorize => Some(self.vectorize.clone()),
        }
    }
}

/// Extractor with nothing to extract: one empty, exhausted batch. Used to
/// smoke-test engine wiring before real collaborators are registered.
pub struct NullExtractor;

#[async_trait]
impl Extractor for NullExtractor {
    async fn extract(
        &self,
        _job_name: &str,
        cursor: NestedCursor,
    ) -> Result<ExtractBatch, StageError> {
        Ok(ExtractBatch {
            records: Vec::new(),
            cursor,
            exhausted: true,
        })
    }
}

/// Handler that forwards every record unchanged.
pub struct PassthroughHandler;

#[async_trait]
impl StageHandler for PassthroughHandler {
    async fn process(&self, msg: &PipelineMessage) -> Result<StageOutput, StageError> {
        Ok(StageOutput::forward(vec![msg.payload.clone()]))
    }
}

impl JobPipeline {
    /// Wiring-test pipeline: extracts nothing, forwards everything.
    pub fn passthrough() -> Self {
        Self {
            extractor: Arc::new(NullExtractor),
            transform: Arc::new(PassthroughHandler),
            load: Arc::new(PassthroughHandler),
            vectorize: Arc::new(PassthroughHandler),
        }
    }
}

/// Pipelines keyed by job name.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<JobPipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_name: impl Into<String>, pipeline: JobPipeline) {
        self.pipelines.insert(job_name.into(), Arc::new(pipeline));
    }

    pub fn get(&self, job_name: &str) -> Option<Arc<JobPipeline>> {
        self.pipelines.get(job_name).cloned()
    }
}
