use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a sync job.
///
/// `Paused` is orthogonal to the run cycle: it is set externally and checked
/// before every transition out of `NotStarted`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Pending,
    Running,
    Finished,
    Failed,
    Paused,
}

impl JobStatus {
    pub fn parse(s: &str) -> JobStatus {
        match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "finished" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            "paused" => JobStatus::Paused,
            _ => JobStatus::NotStarted,
        }
    }
}

/// One configured unit of recurring sync work (e.g. a GitHub sync).
///
/// Created at configuration load time, never destroyed, only deactivated.
/// Mutated exclusively through the orchestrator actor and the owning runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub active: bool,
    pub status: JobStatus,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
            status: JobStatus::NotStarted,
            last_run_started_at: None,
            last_success_at: None,
            retry_count: 0,
            error_message: None,
        }
    }

    /// Eligible to be dispatched: active, not paused, waiting for its turn.
    pub fn is_dispatchable(&self) -> bool {
        self.active && self.status == JobStatus::NotStarted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_snake_case() {
        for status in [
            JobStatus::NotStarted,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Finished,
            JobStatus::Failed,
            JobStatus::Paused,
        ] {
            assert_eq!(JobStatus::parse(&status.to_string()), status);
        }
    }

    #[test]
    fn new_job_is_dispatchable() {
        let job = Job::new("github-sync");
        assert!(job.is_dispatchable());
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn running_or_paused_job_is_not_dispatchable() {
        let mut job = Job::new("github-sync");
        job.status = JobStatus::Running;
        assert!(!job.is_dispatchable());
        job.status = JobStatus::Paused;
        assert!(!job.is_dispatchable());
        job.status = JobStatus::NotStarted;
        job.active = false;
        assert!(!job.is_dispatchable());
    }
}
