use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delay class applied when rescheduling a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntervalMode {
    /// Short delay between a finished job and its successor.
    FastRetry,
    /// Longer delay when the scheduler wraps back to the first job.
    FullCycle,
}

/// Orchestrator-internal record of when a job should next be considered.
/// Lives only for the process lifetime; recovery is carried by checkpoints,
/// not by schedule state.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub job_name: String,
    pub next_eligible_at: DateTime<Utc>,
    pub interval_mode: IntervalMode,
}

impl ScheduleEntry {
    pub fn new(
        job_name: impl Into<String>,
        next_eligible_at: DateTime<Utc>,
        interval_mode: IntervalMode,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            next_eligible_at,
            interval_mode,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_eligible_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn eligibility_is_a_simple_deadline() {
        let now = Utc::now();
        let entry = ScheduleEntry::new("sync-a", now + Duration::minutes(15), IntervalMode::FastRetry);
        assert!(!entry.is_eligible(now));
        assert!(entry.is_eligible(now + Duration::minutes(15)));
    }
}
