//! Top-level scheduler.
//!
//! One actor task owns the job table exclusively; every mutation arrives as
//! a command over an mpsc channel (admin surface, runner completion
//! reports), never through shared-memory locking. Job selection is
//! round-robin over the configured order: the first active NOT_STARTED job
//! runs next with the fast-retry delay, and when none remain the ring wraps
//! to the first active job with the full-cycle delay, resetting finished
//! and failed jobs for the new cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::jobs::JobStore;
use crate::models::job::{Job, JobStatus};
use crate::models::schedule::{IntervalMode, ScheduleEntry};
use crate::pipeline::{IntegrationGate, JobOutcome, JobRunner};

pub mod backoff;

pub use backoff::BackoffPolicy;

/// Scheduling policy knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between a finished job and its successor.
    pub fast_retry: Duration,
    /// Delay when the ring wraps back to the first job.
    pub full_cycle: Duration,
    /// Consecutive failures of one job tolerated before it stops being
    /// fast-retried and waits for the next full cycle.
    pub max_retries: u32,
    /// Backoff curve for rescheduling a job after a transient failure.
    pub retry_backoff: BackoffPolicy,
    /// Scheduler wake-up cadence.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fast_retry: Duration::from_secs(15 * 60),
            full_cycle: Duration::from_secs(60 * 60),
            max_retries: 3,
            retry_backoff: BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(15 * 60)),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Commands accepted by the orchestrator actor.
#[derive(Debug)]
pub enum OrchestratorCommand {
    ForceStart { name: String },
    Stop { name: String },
    Pause { name: String },
    Resume { name: String },
    Snapshot { reply: oneshot::Sender<Vec<Job>> },
    RunCompleted { name: String, outcome: JobOutcome },
}

/// Cloneable handle for talking to the orchestrator actor.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorCommand>,
}

impl OrchestratorHandle {
    pub async fn force_start(&self, name: &str) -> bool {
        self.tx
            .send(OrchestratorCommand::ForceStart { name: name.to_string() })
            .await
            .is_ok()
    }

    pub async fn stop(&self, name: &str) -> bool {
        self.tx
            .send(OrchestratorCommand::Stop { name: name.to_string() })
            .await
            .is_ok()
    }

    pub async fn pause(&self, name: &str) -> bool {
        self.tx
            .send(OrchestratorCommand::Pause { name: name.to_string() })
            .await
            .is_ok()
    }

    pub async fn resume(&self, name: &str) -> bool {
        self.tx
            .send(OrchestratorCommand::Resume { name: name.to_string() })
            .await
            .is_ok()
    }

    pub async fn snapshot(&self) -> Option<Vec<Job>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OrchestratorCommand::Snapshot { reply })
            .await
            .ok()?;
        rx.await.ok()
    }
}

/// Pick the next job and the delay class before it may run.
///
/// First active NOT_STARTED job in configured order wins with the
/// fast-retry delay; if none remain the ring wraps to the first active job
/// with the full-cycle delay.
pub fn next_job(jobs: &[Job]) -> Option<(usize, IntervalMode)> {
    if let Some(idx) = jobs.iter().position(Job::is_dispatchable) {
        return Some((idx, IntervalMode::FastRetry));
    }
    jobs.iter()
        .position(|j| j.active)
        .map(|idx| (idx, IntervalMode::FullCycle))
}

/// The scheduler actor. Owns the job table for the process lifetime.
pub struct Orchestrator {
    jobs: Vec<Job>,
    schedule: HashMap<String, ScheduleEntry>,
    running: HashMap<String, CancellationToken>,
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    gate: Arc<dyn IntegrationGate>,
    config: SchedulerConfig,
    rx: mpsc::Receiver<OrchestratorCommand>,
    tx: mpsc::Sender<OrchestratorCommand>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<JobRunner>,
        gate: Arc<dyn IntegrationGate>,
        config: SchedulerConfig,
    ) -> (Self, OrchestratorHandle) {
        let (tx, rx) = mpsc::channel(64);
        let handle = OrchestratorHandle { tx: tx.clone() };
        (
            Self {
                jobs: Vec::new(),
                schedule: HashMap::new(),
                running: HashMap::new(),
                store,
                runner,
                gate,
                config,
                rx,
                tx,
            },
            handle,
        )
    }

    /// Register the configured jobs (in order) and reconcile statuses left
    /// over from a previous process: a stale RUNNING row means we crashed
    /// mid-run, and its checkpoint, not its status, carries the recovery.
    pub async fn load_jobs(&mut self, configured: &[Job]) {
        for job in configured {
            if let Err(e) = self.store.upsert(job).await {
                tracing::error!(job_name = %job.name, error = %e, "failed to register job");
            }
        }
        match self.store.list().await {
            Ok(jobs) => self.jobs = jobs,
            Err(e) => {
                tracing::error!(error = %e, "failed to load job table, using configured defaults");
                self.jobs = configured.to_vec();
            }
        }
        for job in &mut self.jobs {
            if job.status == JobStatus::Running {
                tracing::warn!(job_name = %job.name, "stale RUNNING status from previous process, resetting");
                job.status = JobStatus::NotStarted;
                if let Err(e) = self.store.update_status(&job.name, JobStatus::NotStarted).await {
                    tracing::error!(job_name = %job.name, error = %e, "failed to reset stale status");
                }
            }
        }
        // First dispatch is immediate; delays apply between jobs.
        if let Some((idx, mode)) = next_job(&self.jobs) {
            let name = self.jobs[idx].name.clone();
            self.schedule
                .insert(name.clone(), ScheduleEntry::new(name, Utc::now(), mode));
        }
    }

    /// Actor loop. A failure inside any single job never escapes this loop;
    /// it becomes a reschedule decision.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("orchestrator shutting down, cancelling running jobs");
                    for (name, token) in &self.running {
                        tracing::info!(job_name = %name, "cancelling");
                        token.cancel();
                    }
                    break;
                }
                Some(cmd) = self.rx.recv() => self.handle_command(cmd).await,
                _ = tick.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&mut self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .schedule
            .values()
            .filter(|e| e.is_eligible(now))
            .map(|e| e.job_name.clone())
            .collect();
        for name in due {
            self.schedule.remove(&name);
            self.dispatch(&name).await;
        }
    }

    async fn dispatch(&mut self, name: &str) {
        let Some(job) = self.jobs.iter().find(|j| j.name == name).cloned() else {
            tracing::error!(job_name = %name, "scheduled job is not configured, dropping");
            return;
        };

        // At-most-one-running: never dispatch a job already RUNNING.
        if self.running.contains_key(name) || job.status == JobStatus::Running {
            tracing::warn!(job_name = %name, "job already running, skipping dispatch");
            return;
        }
        if !job.active || job.status == JobStatus::Paused {
            tracing::info!(job_name = %name, status = %job.status, "job not dispatchable, advancing ring");
            self.plan_next();
            return;
        }

        // Re-validate the external resource before running so a permanently
        // misconfigured job cannot deadlock the ring.
        if !self.gate.is_active(name).await {
            let alert = format!("integration for '{name}' is deactivated; job skipped");
            tracing::warn!(job_name = %name, "integration inactive at dispatch, finishing with alert");
            if let Err(e) = self.store.mark_finished(name, Some(&alert)).await {
                tracing::error!(job_name = %name, error = %e, "failed to record alerted finish");
            }
            self.apply_local(name, |job| {
                job.status = JobStatus::Finished;
                job.error_message = Some(alert.clone());
            });
            self.plan_next();
            return;
        }

        let token = CancellationToken::new();
        self.running.insert(name.to_string(), token.clone());
        self.apply_local(name, |job| job.status = JobStatus::Running);

        let runner = self.runner.clone();
        let tx = self.tx.clone();
        let job_name = name.to_string();
        tokio::spawn(async move {
            let outcome = runner.run(&job_name, token).await;
            // The actor may be gone during shutdown; nothing to report then.
            let _ = tx
                .send(OrchestratorCommand::RunCompleted { name: job_name, outcome })
                .await;
        });
    }

    async fn handle_command(&mut self, cmd: OrchestratorCommand) {
        match cmd {
            OrchestratorCommand::ForceStart { name } => {
                if self.running.contains_key(&name) {
                    tracing::warn!(job_name = %name, "force-start ignored, job already running");
                    return;
                }
                self.set_status(&name, JobStatus::NotStarted).await;
                self.schedule.remove(&name);
                self.dispatch(&name).await;
            }
            OrchestratorCommand::Stop { name } => {
                match self.running.get(&name) {
                    Some(token) => {
                        tracing::info!(job_name = %name, "stop requested");
                        token.cancel();
                    }
                    None => tracing::info!(job_name = %name, "stop requested but job is not running"),
                }
            }
            OrchestratorCommand::Pause { name } => {
                if self.running.contains_key(&name) {
                    tracing::warn!(job_name = %name, "pause ignored for running job, stop it first");
                    return;
                }
                self.set_status(&name, JobStatus::Paused).await;
                self.schedule.remove(&name);
            }
            OrchestratorCommand::Resume { name } => {
                let paused = self
                    .jobs
                    .iter()
                    .any(|j| j.name == name && j.status == JobStatus::Paused);
                if paused {
                    self.set_status(&name, JobStatus::NotStarted).await;
                    self.schedule.insert(
                        name.clone(),
                        ScheduleEntry::new(name, Utc::now(), IntervalMode::FastRetry),
                    );
                }
            }
            OrchestratorCommand::Snapshot { reply } => {
                let _ = reply.send(self.jobs.clone());
            }
            OrchestratorCommand::RunCompleted { name, outcome } => {
                self.running.remove(&name);
                self.refresh_local(&name).await;
                self.reschedule(&name, outcome);
            }
        }
    }

    /// Turn a run outcome into the next schedule entry.
    fn reschedule(&mut self, name: &str, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Finished => {
                tracing::info!(job_name = %name, "job finished, planning successor");
                self.plan_next();
            }
            JobOutcome::FinishedWithAlert(alert) => {
                tracing::warn!(job_name = %name, alert = %alert, "job finished with alert, planning successor");
                self.plan_next();
            }
            JobOutcome::Failed { error, resumable, retry_count } => {
                let within_budget = resumable && retry_count as u32 <= self.config.max_retries;
                if within_budget {
                    let delay = self.config.retry_backoff.delay(retry_count.max(1) as u32 - 1);
                    tracing::warn!(
                        job_name = %name,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "job failed, scheduling fast retry"
                    );
                    self.apply_local(name, |job| job.status = JobStatus::Pending);
                    let eligible =
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                    self.schedule.insert(
                        name.to_string(),
                        ScheduleEntry::new(name, eligible, IntervalMode::FastRetry),
                    );
                } else {
                    tracing::error!(
                        job_name = %name,
                        retry_count,
                        resumable,
                        error = %error,
                        "job failed beyond retry budget, waiting for next cycle"
                    );
                    self.plan_next();
                }
            }
            JobOutcome::Cancelled { .. } => {
                tracing::info!(job_name = %name, "job cancelled, planning successor");
                self.plan_next();
            }
        }
    }

    /// Create the schedule entry for whichever job the ring selects next.
    /// A full-cycle wrap resets completed and failed jobs for the new round.
    fn plan_next(&mut self) {
        let Some((idx, mode)) = next_job(&self.jobs) else {
            tracing::warn!("no active jobs to schedule");
            return;
        };
        if mode == IntervalMode::FullCycle {
            self.reset_cycle();
        }
        let delay = match mode {
            IntervalMode::FastRetry => self.config.fast_retry,
            IntervalMode::FullCycle => self.config.full_cycle,
        };
        let name = self.jobs[idx].name.clone();
        if self.running.contains_key(&name) {
            return;
        }
        let eligible = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        tracing::info!(job_name = %name, mode = %mode, "next job scheduled");
        self.schedule
            .insert(name.clone(), ScheduleEntry::new(name, eligible, mode));
    }

    fn reset_cycle(&mut self) {
        let stale: Vec<String> = self
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Finished | JobStatus::Failed))
            .map(|j| j.name.clone())
            .collect();
        for name in stale {
            self.apply_local(&name, |job| job.status = JobStatus::NotStarted);
            let store = self.store.clone();
            let job_name = name.clone();
            tokio::spawn(async move {
                if let Err(e) = store.update_status(&job_name, JobStatus::NotStarted).await {
                    tracing::error!(job_name = %job_name, error = %e, "failed to persist cycle reset");
                }
            });
        }
    }

    async fn set_status(&mut self, name: &str, status: JobStatus) {
        self.apply_local(name, |job| job.status = status);
        if let Err(e) = self.store.update_status(name, status).await {
            tracing::error!(job_name = %name, error = %e, "failed to persist status change");
        }
    }

    fn apply_local(&mut self, name: &str, f: impl FnOnce(&mut Job)) {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.name == name) {
            f(job);
        }
    }

    /// Pull the runner-written row back into the actor's copy.
    async fn refresh_local(&mut self, name: &str) {
        match self.store.get(name).await {
            Ok(Some(fresh)) => {
                if let Some(job) = self.jobs.iter_mut().find(|j| j.name == name) {
                    *job = fresh;
                }
            }
            Ok(None) => tracing::error!(job_name = %name, "job vanished from store"),
            Err(e) => tracing::error!(job_name = %name, error = %e, "failed to refresh job row"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, status: JobStatus) -> Job {
        let mut j = Job::new(name);
        j.status = status;
        j
    }

    #[test]
    fn picks_first_not_started_with_fast_retry() {
        // Jobs [A(NOT_STARTED), B(FINISHED), C(NOT_STARTED)] select A.
        let jobs = vec![
            job("sync-a", JobStatus::NotStarted),
            job("sync-b", JobStatus::Finished),
            job("sync-c", JobStatus::NotStarted),
        ];
        assert_eq!(next_job(&jobs), Some((0, IntervalMode::FastRetry)));
    }

    #[test]
    fn skips_finished_jobs_within_a_cycle() {
        let jobs = vec![
            job("sync-a", JobStatus::Finished),
            job("sync-b", JobStatus::NotStarted),
        ];
        assert_eq!(next_job(&jobs), Some((1, IntervalMode::FastRetry)));
    }

    #[test]
    fn wraps_to_first_active_with_full_cycle() {
        // All finished selects the first job again, on the long interval.
        let jobs = vec![
            job("sync-a", JobStatus::Finished),
            job("sync-b", JobStatus::Finished),
        ];
        assert_eq!(next_job(&jobs), Some((0, IntervalMode::FullCycle)));
    }

    #[test]
    fn wrap_skips_inactive_jobs() {
        let mut a = job("sync-a", JobStatus::Finished);
        a.active = false;
        let jobs = vec![a, job("sync-b", JobStatus::Finished)];
        assert_eq!(next_job(&jobs), Some((1, IntervalMode::FullCycle)));
    }

    #[test]
    fn no_active_jobs_selects_nothing() {
        let mut a = job("sync-a", JobStatus::NotStarted);
        a.active = false;
        assert_eq!(next_job(&[a]), None);
    }

    #[test]
    fn paused_jobs_are_not_selected_within_a_cycle() {
        let jobs = vec![
            job("sync-a", JobStatus::Paused),
            job("sync-b", JobStatus::NotStarted),
        ];
        assert_eq!(next_job(&jobs), Some((1, IntervalMode::FastRetry)));
    }
}
