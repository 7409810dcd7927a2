//! Shared test doubles: scripted collaborators, in-memory engine wiring,
//! and instrumented store/queue wrappers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use sync_orchestrator::checkpoint::{
    CheckpointData, CheckpointStore, MemoryCheckpointStore, NestedCursor,
};
use sync_orchestrator::error::{QueueError, StageError, StoreError};
use sync_orchestrator::jobs::{JobStore, MemoryJobStore};
use sync_orchestrator::models::job::Job;
use sync_orchestrator::models::message::{PipelineMessage, Stage};
use sync_orchestrator::pipeline::runner::RunnerConfig;
use sync_orchestrator::pipeline::{
    ExtractBatch, Extractor, IntegrationGate, JobPipeline, JobRunner, PipelineRegistry,
    StageHandler, StageOutput,
};
use sync_orchestrator::progress::ProgressBroadcaster;
use sync_orchestrator::queue::{DeadLetter, MemoryStageQueue, StageQueue};
use sync_orchestrator::scheduler::BackoffPolicy;

/// Runner tuning for tests: tiny backoffs, small retry budget.
pub fn test_runner_config() -> RunnerConfig {
    RunnerConfig {
        max_retries: 2,
        backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4)),
        rate_limit_backoff: BackoffPolicy::new(Duration::from_millis(2), Duration::from_millis(8)),
        transform_concurrency: 2,
        load_concurrency: 2,
        vectorize_concurrency: 1,
        poll_interval: Duration::from_millis(5),
        backpressure_threshold: 1000,
    }
}

/// In-memory engine wiring shared by the integration tests.
pub struct TestEngine {
    pub queue: Arc<MemoryStageQueue>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub jobs: Arc<MemoryJobStore>,
    pub progress: ProgressBroadcaster,
}

impl TestEngine {
    pub async fn with_jobs(names: &[&str]) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        for name in names {
            jobs.upsert(&Job::new(*name)).await.unwrap();
        }
        Self {
            queue: Arc::new(MemoryStageQueue::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            jobs,
            progress: ProgressBroadcaster::new(64),
        }
    }

    pub fn runner(
        &self,
        registry: PipelineRegistry,
        gate: Arc<dyn IntegrationGate>,
    ) -> JobRunner {
        self.runner_with_config(registry, gate, test_runner_config())
    }

    pub fn runner_with_config(
        &self,
        registry: PipelineRegistry,
        gate: Arc<dyn IntegrationGate>,
        config: RunnerConfig,
    ) -> JobRunner {
        JobRunner::new(
            self.queue.clone(),
            self.checkpoints.clone(),
            self.jobs.clone(),
            Arc::new(registry),
            gate,
            self.progress.clone(),
            config,
        )
    }
}

/// Extractor iterating a two-level pagination space: `outer_count` entities
/// with `inner_count` items each, one item per batch. A fault can be armed
/// at a specific cursor to simulate a rate limit at that exact position,
/// either until cleared or for a fixed number of calls.
pub struct ScriptedExtractor {
    outer_count: u64,
    inner_count: u64,
    fault: Mutex<Option<ExtractFault>>,
    pub extracted: Mutex<Vec<(u64, u64)>>,
    pub calls: AtomicU64,
    delay: Option<Duration>,
}

struct ExtractFault {
    cursor: NestedCursor,
    remaining: i64,
}

impl ScriptedExtractor {
    pub fn new(outer_count: u64, inner_count: u64) -> Self {
        Self {
            outer_count,
            inner_count,
            fault: Mutex::new(None),
            extracted: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every extract at `cursor` until [`Self::clear_failure`].
    pub fn fail_at(&self, cursor: NestedCursor) {
        *self.fault.lock().unwrap() = Some(ExtractFault { cursor, remaining: i64::MAX });
    }

    /// Fail the next `times` extracts at `cursor`, then recover.
    pub fn fail_at_times(&self, cursor: NestedCursor, times: i64) {
        *self.fault.lock().unwrap() = Some(ExtractFault { cursor, remaining: times });
    }

    pub fn clear_failure(&self) {
        *self.fault.lock().unwrap() = None;
    }

    pub fn record(outer: u64, inner: u64) -> Value {
        json!({
            "external_id": format!("{outer}-{inner}"),
            "outer": outer,
            "inner": inner,
        })
    }

    pub fn total_records(&self) -> u64 {
        self.outer_count * self.inner_count
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        _job_name: &str,
        cursor: NestedCursor,
    ) -> Result<ExtractBatch, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut fault = self.fault.lock().unwrap();
            if let Some(f) = fault.as_mut() {
                if f.cursor == cursor && f.remaining > 0 {
                    if f.remaining != i64::MAX {
                        f.remaining -= 1;
                    }
                    return Err(StageError::RateLimited(format!(
                        "api quota exhausted at outer={} inner={}",
                        cursor.outer, cursor.inner
                    )));
                }
            }
        }

        if cursor.outer >= self.outer_count {
            return Ok(ExtractBatch {
                records: Vec::new(),
                cursor,
                exhausted: true,
            });
        }

        self.extracted
            .lock()
            .unwrap()
            .push((cursor.outer, cursor.inner));
        let records = vec![Self::record(cursor.outer, cursor.inner)];

        let next = if cursor.inner + 1 >= self.inner_count {
            NestedCursor { outer: cursor.outer + 1, inner: 0, inner_inner: None }
        } else {
            NestedCursor { outer: cursor.outer, inner: cursor.inner + 1, inner_inner: None }
        };

        Ok(ExtractBatch {
            records,
            cursor: next,
            exhausted: next.outer >= self.outer_count,
        })
    }
}

/// Final data state keyed by external ID. Upsert semantics make replay
/// idempotent: re-loading the same ID overwrites rather than duplicates.
#[derive(Default)]
pub struct UpsertSink {
    rows: Mutex<HashMap<String, Value>>,
    pub upserts: AtomicU64,
}

impl UpsertSink {
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.rows.lock().unwrap().contains_key(external_id)
    }

    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }
}

/// Transform stage double: marks the record and forwards it.
pub struct MarkingTransform;

#[async_trait]
impl StageHandler for MarkingTransform {
    async fn process(&self, msg: &PipelineMessage) -> Result<StageOutput, StageError> {
        let mut record = msg.payload.clone();
        if let Some(obj) = record.as_object_mut() {
            obj.insert("transformed".to_string(), Value::Bool(true));
        }
        Ok(StageOutput::forward(vec![record]))
    }
}

/// Load stage double: upserts by external ID and forwards.
pub struct UpsertLoad {
    pub sink: Arc<UpsertSink>,
}

#[async_trait]
impl StageHandler for UpsertLoad {
    async fn process(&self, msg: &PipelineMessage) -> Result<StageOutput, StageError> {
        let external_id = msg
            .payload
            .get("external_id")
            .and_then(Value::as_str)
            .ok_or_else(|| StageError::Permanent("record missing external_id".into()))?
            .to_string();
        self.sink
            .rows
            .lock()
            .unwrap()
            .insert(external_id, msg.payload.clone());
        self.sink.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(StageOutput::forward(vec![msg.payload.clone()]))
    }
}

/// Vectorize stage double: counts what reaches the final stage.
#[derive(Default)]
pub struct CountingVectorize {
    pub count: AtomicU64,
}

#[async_trait]
impl StageHandler for CountingVectorize {
    async fn process(&self, _msg: &PipelineMessage) -> Result<StageOutput, StageError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(StageOutput::default())
    }
}

/// Handler that fails transiently a fixed number of times, then succeeds.
pub struct FailNTimes {
    remaining: AtomicI64,
}

impl FailNTimes {
    pub fn new(times: i64) -> Self {
        Self { remaining: AtomicI64::new(times) }
    }
}

#[async_trait]
impl StageHandler for FailNTimes {
    async fn process(&self, msg: &PipelineMessage) -> Result<StageOutput, StageError> {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(StageError::Transient("downstream unavailable".into()));
        }
        Ok(StageOutput::forward(vec![msg.payload.clone()]))
    }
}

/// Handler that never succeeds.
pub struct AlwaysFail;

#[async_trait]
impl StageHandler for AlwaysFail {
    async fn process(&self, _msg: &PipelineMessage) -> Result<StageOutput, StageError> {
        Err(StageError::Transient("downstream unavailable".into()))
    }
}

/// Transform double for partial batches: records with an odd `inner` are
/// rejected individually, the rest forward.
pub struct RejectOddInner;

#[async_trait]
impl StageHandler for RejectOddInner {
    async fn process(&self, msg: &PipelineMessage) -> Result<StageOutput, StageError> {
        let inner = msg.payload.get("inner").and_then(Value::as_u64).unwrap_or(0);
        if inner % 2 == 1 {
            Ok(StageOutput {
                records: Vec::new(),
                rejected: vec![sync_orchestrator::pipeline::RejectedRecord {
                    record: msg.payload.clone(),
                    error: format!("validation failed for inner={inner}"),
                }],
            })
        } else {
            Ok(StageOutput::forward(vec![msg.payload.clone()]))
        }
    }
}

/// Gate that reports active for the first `budget` checks, then inactive.
pub struct CountdownGate {
    remaining: AtomicI64,
}

impl CountdownGate {
    pub fn new(budget: i64) -> Self {
        Self { remaining: AtomicI64::new(budget) }
    }
}

#[async_trait]
impl IntegrationGate for CountdownGate {
    async fn is_active(&self, _job_name: &str) -> bool {
        self.remaining.fetch_sub(1, Ordering::SeqCst) > 0
    }
}

/// Gate toggleable from the test body.
pub struct ToggleGate {
    active: AtomicBool,
}

impl ToggleGate {
    pub fn new(active: bool) -> Self {
        Self { active: AtomicBool::new(active) }
    }

    pub fn set(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

#[async_trait]
impl IntegrationGate for ToggleGate {
    async fn is_active(&self, _job_name: &str) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Shared chronological record of store/queue operations, used to verify
/// checkpoint-then-ack ordering.
#[derive(Default, Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

/// Checkpoint store wrapper that records saves and can be switched to fail.
pub struct InstrumentedCheckpointStore {
    inner: Arc<MemoryCheckpointStore>,
    log: EventLog,
    failing: AtomicBool,
}

impl InstrumentedCheckpointStore {
    pub fn new(inner: Arc<MemoryCheckpointStore>, log: EventLog) -> Self {
        Self {
            inner,
            log,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for InstrumentedCheckpointStore {
    async fn save(&self, job_name: &str, data: &CheckpointData) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            self.log.push(format!("save-failed:{job_name}"));
            return Err(StoreError::UnknownJob(format!("induced save failure for {job_name}")));
        }
        self.log.push(format!("save:{job_name}"));
        self.inner.save(job_name, data).await
    }

    async fn load(&self, job_name: &str) -> Result<Option<CheckpointData>, StoreError> {
        self.inner.load(job_name).await
    }

    async fn clear(&self, job_name: &str) -> Result<(), StoreError> {
        self.log.push(format!("clear:{job_name}"));
        self.inner.clear(job_name).await
    }
}

/// Queue wrapper that records acks.
pub struct InstrumentedQueue {
    inner: Arc<MemoryStageQueue>,
    log: EventLog,
}

impl InstrumentedQueue {
    pub fn new(inner: Arc<MemoryStageQueue>, log: EventLog) -> Self {
        Self { inner, log }
    }
}

#[async_trait]
impl StageQueue for InstrumentedQueue {
    async fn enqueue(&self, msg: &PipelineMessage) -> Result<(), QueueError> {
        self.inner.enqueue(msg).await
    }

    async fn dequeue(&self, stage: Stage) -> Result<Option<PipelineMessage>, QueueError> {
        self.inner.dequeue(stage).await
    }

    async fn ack(&self, msg: &PipelineMessage) -> Result<(), QueueError> {
        self.log.push(format!("ack:{}:{}", msg.stage, msg.job_name));
        self.inner.ack(msg).await
    }

    async fn requeue(&self, msg: &PipelineMessage) -> Result<(), QueueError> {
        self.inner.requeue(msg).await
    }

    async fn dead_letter(&self, msg: &PipelineMessage, error: &str) -> Result<(), QueueError> {
        self.inner.dead_letter(msg, error).await
    }

    async fn depth(&self, stage: Stage) -> Result<u64, QueueError> {
        self.inner.depth(stage).await
    }

    async fn recover(&self, stage: Stage) -> Result<u64, QueueError> {
        self.inner.recover(stage).await
    }

    async fn dead_letters(&self, stage: Stage) -> Result<Vec<DeadLetter>, QueueError> {
        self.inner.dead_letters(stage).await
    }
}

/// Standard pipeline wiring over the scripted extractor and sinks.
pub struct SinkPipeline {
    pub extractor: Arc<ScriptedExtractor>,
    pub sink: Arc<UpsertSink>,
    pub vectorized: Arc<CountingVectorize>,
}

impl SinkPipeline {
    pub fn new(outer: u64, inner: u64) -> Self {
        Self::with_extractor(ScriptedExtractor::new(outer, inner))
    }

    pub fn with_extractor(extractor: ScriptedExtractor) -> Self {
        Self {
            extractor: Arc::new(extractor),
            sink: Arc::new(UpsertSink::default()),
            vectorized: Arc::new(CountingVectorize::default()),
        }
    }

    pub fn pipeline(&self) -> JobPipeline {
        JobPipeline {
            extractor: self.extractor.clone(),
            transform: Arc::new(MarkingTransform),
            load: Arc::new(UpsertLoad { sink: self.sink.clone() }),
            vectorize: self.vectorized.clone(),
        }
    }

    pub fn registry(&self, job_name: &str) -> PipelineRegistry {
        let mut registry = PipelineRegistry::new();
        registry.register(job_name, self.pipeline());
        registry
    }
}
