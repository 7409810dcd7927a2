//! Per-job pipeline driver and state machine.
//!
//! One runner instance owns one job for the duration of a run: it is the
//! sole writer of that job's row and checkpoint (the orchestrator enforces
//! at-most-one-running per job name). Stage consumers run concurrently with
//! the extract loop so backpressure can actually clear, but completion is
//! strictly sequential: a stage only counts as drained once the stage
//! feeding it has finished, so transform cannot complete on partially
//! extracted data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointData, CheckpointStore, NestedCursor};
use crate::error::{EngineError, StageError};
use crate::jobs::JobStore;
use crate::models::message::{PipelineMessage, Stage};
use crate::pipeline::{IntegrationGate, JobPipeline, PipelineRegistry};
use crate::progress::ProgressBroadcaster;
use crate::queue::StageQueue;
use crate::scheduler::backoff::BackoffPolicy;

use super::worker::{DrainStats, StageWorker, WorkerConfig};

const EXHAUSTED_KEY: &str = "extract_exhausted";

/// Tuning for one runner instance.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Consecutive transient/rate-limit failures tolerated inside the
    /// extract loop before the job fails (resumably).
    pub max_retries: u32,
    /// Backoff applied between extract retries after transient failures.
    pub backoff: BackoffPolicy,
    /// Backoff applied when the upstream rate-limits. Deliberately a longer
    /// curve: hammering a throttling API with the transient cadence only
    /// extends the penalty window.
    pub rate_limit_backoff: BackoffPolicy,
    /// Consumer concurrency for the transform stage.
    pub transform_concurrency: usize,
    /// Consumer concurrency for the load stage.
    pub load_concurrency: usize,
    /// Consumer concurrency for the vectorize stage.
    pub vectorize_concurrency: usize,
    /// Idle poll interval for stage consumers.
    pub poll_interval: Duration,
    /// Downstream queue depth above which upstream consumption pauses.
    pub backpressure_threshold: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            rate_limit_backoff: BackoffPolicy::new(
                Duration::from_secs(5),
                Duration::from_secs(300),
            ),
            transform_concurrency: 4,
            load_concurrency: 4,
            vectorize_concurrency: 2,
            poll_interval: Duration::from_millis(50),
            backpressure_threshold: 500,
        }
    }
}

impl RunnerConfig {
    fn worker_config(&self, stage: Stage) -> WorkerConfig {
        let concurrency = match stage {
            Stage::Extract => 1,
            Stage::Transform => self.transform_concurrency,
            Stage::Load => self.load_concurrency,
            Stage::Vectorize => self.vectorize_concurrency,
        };
        WorkerConfig {
            concurrency,
            max_retries: self.max_retries,
            poll_interval: self.poll_interval,
            backpressure_threshold: self.backpressure_threshold,
        }
    }
}

/// Classified result of one run, reported back to the orchestrator.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// All four stages completed; checkpoint cleared.
    Finished,
    /// The external integration was deactivated; the current batch was
    /// finished and the job closed with an alert instead of failing.
    FinishedWithAlert(String),
    /// The run failed. `resumable` mirrors the persisted `recovery_mode`.
    Failed {
        error: String,
        resumable: bool,
        retry_count: i32,
    },
    /// A stop request interrupted the run between messages; the checkpoint
    /// is resumable.
    Cancelled { retry_count: i32 },
}

/// Drives one job through extract → transform → load → vectorize.
pub struct JobRunner {
    queue: Arc<dyn StageQueue>,
    checkpoints: Arc<dyn CheckpointStore>,
    jobs: Arc<dyn JobStore>,
    registry: Arc<PipelineRegistry>,
    gate: Arc<dyn IntegrationGate>,
    progress: ProgressBroadcaster,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(
        queue: Arc<dyn StageQueue>,
        checkpoints: Arc<dyn CheckpointStore>,
        jobs: Arc<dyn JobStore>,
        registry: Arc<PipelineRegistry>,
        gate: Arc<dyn IntegrationGate>,
        progress: ProgressBroadcaster,
        config: RunnerConfig,
    ) -> Self {
        Self {
            queue,
            checkpoints,
            jobs,
            registry,
            gate,
            progress,
            config,
        }
    }

    /// Run one job to an outcome. Engine-level errors (store/queue) are
    /// folded into a resumable `Failed` outcome; this function never
    /// propagates an error to the orchestrator loop.
    pub async fn run(&self, job_name: &str, cancel: CancellationToken) -> JobOutcome {
        let started = std::time::Instant::now();
        let outcome = match self.try_run(job_name, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => self.fail(job_name, &e.to_string(), true).await,
        };
        metrics::histogram!("sync_job_duration_seconds").record(started.elapsed().as_secs_f64());
        match &outcome {
            JobOutcome::Finished | JobOutcome::FinishedWithAlert(_) => {
                metrics::counter!("sync_jobs_completed_total").increment(1);
            }
            JobOutcome::Failed { .. } | JobOutcome::Cancelled { .. } => {
                metrics::counter!("sync_jobs_failed_total").increment(1);
            }
        }
        outcome
    }

    async fn try_run(
        &self,
        job_name: &str,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, EngineError> {
        let Some(pipeline) = self.registry.get(job_name) else {
            let outcome = self
                .fail_permanent(job_name, &format!("no pipeline registered for '{job_name}'"))
                .await;
            return Ok(outcome);
        };

        let checkpoint = self.checkpoints.load(job_name).await?.unwrap_or_default();
        let resuming = checkpoint.recovery_mode();
        if resuming {
            tracing::info!(
                job_name = %job_name,
                cursor = ?checkpoint.cursor(),
                stage = checkpoint.stage().unwrap_or("extract"),
                "resuming interrupted job from checkpoint"
            );
        }

        self.jobs.mark_run_started(job_name).await?;
        tracing::info!(job_name = %job_name, resuming, "job run started");

        // Extract is driven directly by the cursor loop; the later stages
        // consume the queues it feeds.
        let extract_done = resuming
            && checkpoint
                .get(EXHAUSTED_KEY)
                .and_then(Value::as_bool)
                .unwrap_or(false);

        // Spawn the downstream consumers up front so extract's backpressure
        // pauses can clear: a paused producer needs a live consumer on the
        // other side of the queue. Each consumer is handed a flag its
        // upstream flips on completion, which keeps the drain barrier
        // sequential even though consumption is concurrent.
        let worker_cancel = cancel.child_token();
        let extract_complete = Arc::new(AtomicBool::new(extract_done));
        let mut consumers: Vec<StageConsumer> = Vec::new();
        let mut upstream = extract_complete.clone();
        for stage in [Stage::Transform, Stage::Load, Stage::Vectorize] {
            let Some(handler) = pipeline.handler(stage) else {
                continue;
            };
            let worker = StageWorker::new(
                stage,
                handler,
                self.queue.clone(),
                self.checkpoints.clone(),
                self.config.worker_config(stage),
            );
            let complete = Arc::new(AtomicBool::new(false));
            let token = worker_cancel.clone();
            let done = upstream.clone();
            let handle = tokio::spawn(async move { worker.drain_with(&token, done).await });
            consumers.push((stage, complete.clone(), handle));
            upstream = complete;
        }

        if !extract_done {
            let cursor = if resuming { checkpoint.cursor() } else { NestedCursor::start() };
            let end = match self.run_extract(job_name, &pipeline, cursor, cancel).await {
                Ok(end) => end,
                Err(e) => {
                    abort_consumers(&worker_cancel, consumers).await;
                    return Err(e);
                }
            };
            match end {
                ExtractEnd::Exhausted => {}
                ExtractEnd::Cancelled => {
                    abort_consumers(&worker_cancel, consumers).await;
                    return Ok(self.cancelled(job_name).await);
                }
                ExtractEnd::IntegrationInactive => {
                    abort_consumers(&worker_cancel, consumers).await;
                    return Ok(self.finish_with_alert(job_name).await?);
                }
                ExtractEnd::Failed { error, resumable } => {
                    abort_consumers(&worker_cancel, consumers).await;
                    return Ok(self.fail(job_name, &error, resumable).await);
                }
            }
        }
        extract_complete.store(true, Ordering::SeqCst);
        self.emit(job_name, Stage::Extract, "extraction complete");

        let mut remaining = consumers.into_iter();
        while let Some((stage, complete, handle)) = remaining.next() {
            let stats = match handle.await {
                Ok(Ok(stats)) => stats,
                Ok(Err(e)) => {
                    abort_consumers(&worker_cancel, remaining.collect()).await;
                    return Err(e);
                }
                Err(e) => {
                    abort_consumers(&worker_cancel, remaining.collect()).await;
                    return Err(
                        StageError::Transient(format!("stage consumer panicked: {e}")).into()
                    );
                }
            };
            complete.store(true, Ordering::SeqCst);
            tracing::info!(
                job_name = %job_name,
                stage = %stage,
                processed = stats.processed,
                forwarded = stats.forwarded,
                dead_lettered = stats.dead_lettered,
                "stage drained"
            );

            if cancel.is_cancelled() {
                abort_consumers(&worker_cancel, remaining.collect()).await;
                return Ok(self.cancelled(job_name).await);
            }
            if !self.gate.is_active(job_name).await {
                abort_consumers(&worker_cancel, remaining.collect()).await;
                return Ok(self.finish_with_alert(job_name).await?);
            }
            self.emit(job_name, stage, "stage complete");
        }

        // Clean completion: the checkpoint is only cleared here, after the
        // final stage finished without error.
        self.checkpoints.clear(job_name).await?;
        self.jobs.mark_finished(job_name, None).await?;
        self.progress.publish(job_name, Stage::Vectorize, 100, "job finished");
        tracing::info!(job_name = %job_name, "job finished cleanly");
        Ok(JobOutcome::Finished)
    }

    async fn run_extract(
        &self,
        job_name: &str,
        pipeline: &JobPipeline,
        mut cursor: NestedCursor,
        cancel: &CancellationToken,
    ) -> Result<ExtractEnd, EngineError> {
        let mut consecutive_failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                self.save_recovery_cursor(job_name, &cursor).await?;
                return Ok(ExtractEnd::Cancelled);
            }
            if !self.gate.is_active(job_name).await {
                // The batch boundary is the safe point: cursor already
                // persisted for everything enqueued so far.
                self.save_recovery_cursor(job_name, &cursor).await?;
                return Ok(ExtractEnd::IntegrationInactive);
            }

            match pipeline.extractor.extract(job_name, cursor).await {
                Ok(batch) => {
                    consecutive_failures = 0;
                    self.wait_for_capacity(Stage::Transform, cancel).await?;
                    for record in batch.records {
                        let msg = PipelineMessage::new(job_name, Stage::Transform, record);
                        self.queue.enqueue(&msg).await?;
                    }

                    // Checkpoint the new cursor only after the batch is
                    // durably enqueued. A crash in between replays the
                    // batch; downstream upsert-by-external-id absorbs it.
                    cursor = batch.cursor;
                    let mut patch = CheckpointData::new();
                    patch.set_cursor(&cursor);
                    patch.set_stage(&Stage::Extract);
                    patch.set_recovery_mode(true);
                    if batch.exhausted {
                        patch.set(EXHAUSTED_KEY, Value::Bool(true));
                    }
                    self.checkpoints.save(job_name, &patch).await?;

                    if batch.exhausted {
                        return Ok(ExtractEnd::Exhausted);
                    }
                }
                Err(StageError::Permanent(reason)) => {
                    return Ok(ExtractEnd::Failed { error: reason, resumable: false });
                }
                Err(err) => {
                    consecutive_failures += 1;
                    if consecutive_failures > self.config.max_retries {
                        // Budget exhausted: checkpoint at the innermost
                        // cursor, never abandon back to the outer one.
                        self.save_recovery_cursor(job_name, &cursor).await?;
                        return Ok(ExtractEnd::Failed {
                            error: format!(
                                "extract retry budget exhausted after {consecutive_failures} attempts: {err}"
                            ),
                            resumable: true,
                        });
                    }
                    let policy = if err.is_rate_limit() {
                        &self.config.rate_limit_backoff
                    } else {
                        &self.config.backoff
                    };
                    let delay = policy.delay(consecutive_failures - 1);
                    tracing::warn!(
                        job_name = %job_name,
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        rate_limited = err.is_rate_limit(),
                        error = %err,
                        "extract failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.save_recovery_cursor(job_name, &cursor).await?;
                            return Ok(ExtractEnd::Cancelled);
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Block until the stage queue is under the backpressure threshold.
    async fn wait_for_capacity(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        while self.queue.depth(stage).await? > self.config.backpressure_threshold {
            if cancel.is_cancelled() {
                return Ok(());
            }
            tracing::debug!(stage = %stage, "stage queue over threshold, extract pausing");
            sleep(self.config.poll_interval).await;
        }
        Ok(())
    }

    async fn save_recovery_cursor(
        &self,
        job_name: &str,
        cursor: &NestedCursor,
    ) -> Result<(), EngineError> {
        let mut patch = CheckpointData::new();
        patch.set_cursor(cursor);
        patch.set_stage(&Stage::Extract);
        patch.set_recovery_mode(true);
        self.checkpoints.save(job_name, &patch).await?;
        Ok(())
    }

    async fn finish_with_alert(&self, job_name: &str) -> Result<JobOutcome, EngineError> {
        let alert = format!("integration for '{job_name}' is deactivated; job closed without sync");
        self.jobs.mark_finished(job_name, Some(&alert)).await?;
        tracing::warn!(job_name = %job_name, "integration inactive, job finished with alert");
        Ok(JobOutcome::FinishedWithAlert(alert))
    }

    async fn fail(&self, job_name: &str, error: &str, resumable: bool) -> JobOutcome {
        // A mid-run checkpoint (recovery_mode=true) is already on disk for
        // the resumable case; a permanent failure demotes the marker so the
        // next run starts fresh instead of replaying a doomed cursor.
        if !resumable {
            let mut patch = CheckpointData::new();
            patch.set_recovery_mode(false);
            if let Err(e) = self.checkpoints.save(job_name, &patch).await {
                tracing::error!(job_name = %job_name, error = %e, "failed to demote checkpoint");
            }
        }

        let retry_count = match self.jobs.mark_failed(job_name, error).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(job_name = %job_name, error = %e, "failed to record job failure");
                0
            }
        };
        tracing::error!(job_name = %job_name, retry_count, resumable, error = %error, "job failed");
        JobOutcome::Failed {
            error: error.to_string(),
            resumable,
            retry_count,
        }
    }

    async fn fail_permanent(&self, job_name: &str, error: &str) -> JobOutcome {
        self.fail(job_name, error, false).await
    }

    async fn cancelled(&self, job_name: &str) -> JobOutcome {
        let retry_count = match self.jobs.mark_failed(job_name, "stopped by operator").await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(job_name = %job_name, error = %e, "failed to record cancellation");
                0
            }
        };
        tracing::info!(job_name = %job_name, "job cancelled, checkpoint preserved");
        JobOutcome::Cancelled { retry_count }
    }

    fn emit(&self, job_name: &str, stage: Stage, detail: &str) {
        self.progress
            .publish(job_name, stage, stage.completion_percent(), detail);
    }
}

enum ExtractEnd {
    Exhausted,
    Cancelled,
    IntegrationInactive,
    Failed { error: String, resumable: bool },
}

type StageConsumer = (
    Stage,
    Arc<AtomicBool>,
    JoinHandle<Result<DrainStats, EngineError>>,
);

/// Stop the remaining stage consumers and wait for them to settle, so no
/// task outlives the run still writing checkpoints or acking messages.
async fn abort_consumers(worker_cancel: &CancellationToken, consumers: Vec<StageConsumer>) {
    worker_cancel.cancel();
    for (_, _, handle) in consumers {
        let _ = handle.await;
    }
}
