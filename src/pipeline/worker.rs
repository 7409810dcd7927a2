//! Stage consumers.
//!
//! A [`StageWorker`] drains one stage's queue with a bounded pool of
//! consumer tasks. All error classification happens here, at the worker
//! boundary: the runner above only ever sees drain statistics or an
//! [`EngineError`], never a raw collaborator failure.
//!
//! Two orderings are load-bearing:
//! - checkpoint-then-ack: a message is acked only after the checkpoint
//!   describing its completion has persisted. A failed checkpoint write
//!   leaves the message unacked so replay covers it.
//! - cancellation is observed between messages, never mid-message, so a
//!   stop request always leaves a resumable checkpoint.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointData, CheckpointStore};
use crate::error::{EngineError, StageError};
use crate::models::message::{PipelineMessage, Stage};
use crate::pipeline::StageHandler;
use crate::queue::StageQueue;

/// Per-stage worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent consumer tasks. Kept low for upstream-rate-limited stages,
    /// higher for CPU/DB-bound ones.
    pub concurrency: usize,
    /// Requeue budget before a message is dead-lettered.
    pub max_retries: u32,
    /// Sleep between polls when the queue is empty or backpressured.
    pub poll_interval: Duration,
    /// Pause consumption while the downstream queue is deeper than this.
    pub backpressure_threshold: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_retries: 3,
            poll_interval: Duration::from_millis(50),
            backpressure_threshold: 500,
        }
    }
}

/// Counters aggregated over one drain pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainStats {
    pub processed: u64,
    pub forwarded: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl DrainStats {
    fn absorb(&mut self, other: DrainStats) {
        self.processed += other.processed;
        self.forwarded += other.forwarded;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
    }
}

struct WorkerInner {
    stage: Stage,
    handler: Arc<dyn StageHandler>,
    queue: Arc<dyn StageQueue>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: WorkerConfig,
    processed: AtomicU64,
}

/// Consumer pool for one pipeline stage.
pub struct StageWorker {
    inner: Arc<WorkerInner>,
}

impl StageWorker {
    pub fn new(
        stage: Stage,
        handler: Arc<dyn StageHandler>,
        queue: Arc<dyn StageQueue>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                stage,
                handler,
                queue,
                checkpoints,
                config,
                processed: AtomicU64::new(0),
            }),
        }
    }

    /// Consume until the stage queue is empty and no message is in flight,
    /// or until cancelled. For a queue whose producer has already finished.
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<DrainStats, EngineError> {
        self.drain_with(cancel, Arc::new(AtomicBool::new(true))).await
    }

    /// Consume alongside a live upstream producer. The stage only counts as
    /// drained once `upstream_done` is set, no message is in flight, and the
    /// queue is empty; until the flag flips, an empty queue just means the
    /// producer has not caught up yet.
    pub async fn drain_with(
        &self,
        cancel: &CancellationToken,
        upstream_done: Arc<AtomicBool>,
    ) -> Result<DrainStats, EngineError> {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for _ in 0..self.inner.config.concurrency.max(1) {
            let inner = self.inner.clone();
            let cancel = cancel.clone();
            let in_flight = in_flight.clone();
            let upstream_done = upstream_done.clone();
            tasks.spawn(async move { inner.consume_loop(cancel, in_flight, upstream_done).await });
        }

        let mut stats = DrainStats::default();
        while let Some(joined) = tasks.join_next().await {
            let task_stats = joined
                .map_err(|e| StageError::Transient(format!("stage consumer panicked: {e}")))??;
            stats.absorb(task_stats);
        }
        Ok(stats)
    }
}

impl WorkerInner {
    async fn consume_loop(
        &self,
        cancel: CancellationToken,
        in_flight: Arc<AtomicUsize>,
        upstream_done: Arc<AtomicBool>,
    ) -> Result<DrainStats, EngineError> {
        let mut stats = DrainStats::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.downstream_backpressured().await? {
                tracing::debug!(stage = %self.stage, "downstream backpressure, pausing consumption");
                sleep(self.config.poll_interval).await;
                continue;
            }

            // Count ourselves in flight before the dequeue so an idle peer
            // cannot observe an empty queue and zero in-flight while we hold
            // an unprocessed message.
            in_flight.fetch_add(1, Ordering::SeqCst);
            let msg = match self.queue.dequeue(self.stage).await {
                Ok(msg) => msg,
                Err(e) => {
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    return Err(e.into());
                }
            };

            match msg {
                Some(msg) => {
                    let result = self.process_message(&msg, &mut stats).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    result?;
                }
                None => {
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let drained = upstream_done.load(Ordering::SeqCst)
                        && in_flight.load(Ordering::SeqCst) == 0
                        && self.queue.depth(self.stage).await? == 0;
                    if drained {
                        break;
                    }
                    sleep(self.config.poll_interval).await;
                }
            }
        }

        Ok(stats)
    }

    async fn downstream_backpressured(&self) -> Result<bool, EngineError> {
        let Some(downstream) = self.stage.next() else {
            return Ok(false);
        };
        let depth = self.queue.depth(downstream).await?;
        metrics::gauge!("sync_stage_queue_depth", "stage" => downstream.to_string())
            .set(depth as f64);
        Ok(depth > self.config.backpressure_threshold)
    }

    async fn process_message(
        &self,
        msg: &PipelineMessage,
        stats: &mut DrainStats,
    ) -> Result<(), EngineError> {
        match self.handler.process(msg).await {
            Ok(output) => {
                self.forward(msg, output.records, stats).await?;

                for rejected in output.rejected {
                    let dead = PipelineMessage::new(&msg.job_name, msg.stage, rejected.record);
                    self.queue.dead_letter(&dead, &rejected.error).await?;
                    stats.dead_lettered += 1;
                    metrics::counter!("sync_messages_dead_lettered_total").increment(1);
                    tracing::warn!(
                        job_name = %msg.job_name,
                        stage = %msg.stage,
                        error = %rejected.error,
                        "record rejected, dead-lettered individually"
                    );
                }

                // Checkpoint-then-ack. If the save fails the message stays
                // unacked and is retried; acking first would lose it on a
                // crash between the two writes.
                if let Err(e) = self.save_progress(msg).await {
                    tracing::error!(
                        job_name = %msg.job_name,
                        stage = %msg.stage,
                        error = %e,
                        "checkpoint save failed, message left unacked"
                    );
                    self.retry_or_dead_letter(msg, &format!("checkpoint save failed: {e}"), stats)
                        .await?;
                    return Ok(());
                }
                self.queue.ack(msg).await?;

                stats.processed += 1;
                metrics::counter!("sync_messages_processed_total").increment(1);
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    job_name = %msg.job_name,
                    stage = %msg.stage,
                    attempt = msg.attempt_count,
                    error = %err,
                    "retryable stage error"
                );
                self.retry_or_dead_letter(msg, &err.to_string(), stats).await
            }
            Err(err) => {
                tracing::error!(
                    job_name = %msg.job_name,
                    stage = %msg.stage,
                    error = %err,
                    "permanent stage error, dead-lettering"
                );
                self.queue.dead_letter(msg, &err.to_string()).await?;
                stats.dead_lettered += 1;
                metrics::counter!("sync_messages_dead_lettered_total").increment(1);
                Ok(())
            }
        }
    }

    async fn forward(
        &self,
        msg: &PipelineMessage,
        records: Vec<Value>,
        stats: &mut DrainStats,
    ) -> Result<(), EngineError> {
        let Some(next) = self.stage.next() else {
            return Ok(());
        };
        for record in records {
            let downstream = PipelineMessage::new(&msg.job_name, next, record);
            self.queue.enqueue(&downstream).await?;
            stats.forwarded += 1;
        }
        Ok(())
    }

    async fn save_progress(&self, msg: &PipelineMessage) -> Result<(), EngineError> {
        let done = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        let mut patch = CheckpointData::new();
        patch.set_stage(&self.stage);
        patch.set_recovery_mode(true);
        patch.set(format!("{}_processed", self.stage), Value::from(done));
        self.checkpoints.save(&msg.job_name, &patch).await?;
        Ok(())
    }

    async fn retry_or_dead_letter(
        &self,
        msg: &PipelineMessage,
        error: &str,
        stats: &mut DrainStats,
    ) -> Result<(), EngineError> {
        if msg.attempt_count >= self.config.max_retries {
            self.queue.dead_letter(msg, error).await?;
            stats.dead_lettered += 1;
            metrics::counter!("sync_messages_dead_lettered_total").increment(1);
            tracing::warn!(
                job_name = %msg.job_name,
                stage = %msg.stage,
                attempts = msg.attempt_count,
                "retry budget exhausted, dead-lettered"
            );
        } else {
            self.queue.requeue(msg).await?;
            stats.requeued += 1;
        }
        Ok(())
    }
}
