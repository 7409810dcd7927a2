use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline phase a message belongs to. Order is strict: a job's data moves
/// extract → transform → load → vectorize, never backwards or skipping.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Extract,
    Transform,
    Load,
    Vectorize,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Extract, Stage::Transform, Stage::Load, Stage::Vectorize];

    /// The stage that consumes this stage's output, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Extract => Some(Stage::Transform),
            Stage::Transform => Some(Stage::Load),
            Stage::Load => Some(Stage::Vectorize),
            Stage::Vectorize => None,
        }
    }

    /// Job progress once this stage has fully drained. The fifth checkpoint
    /// (100) is emitted by the runner after final bookkeeping.
    pub fn completion_percent(self) -> u8 {
        match self {
            Stage::Extract => 20,
            Stage::Transform => 40,
            Stage::Load => 60,
            Stage::Vectorize => 80,
        }
    }
}

/// Unit of work flowing through a stage queue. The payload is opaque to the
/// queue; only collaborators interpret it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineMessage {
    /// Stable identity of the logical record across requeues.
    pub id: Uuid,
    pub job_name: String,
    pub stage: Stage,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PipelineMessage {
    pub fn new(job_name: impl Into<String>, stage: Stage, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            stage,
            payload,
            attempt_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Copy of this message for requeue after a failure. The id is kept;
    /// `attempt_count` increments only here.
    pub fn requeued(&self) -> Self {
        Self {
            attempt_count: self.attempt_count + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_strict() {
        assert_eq!(Stage::Extract.next(), Some(Stage::Transform));
        assert_eq!(Stage::Transform.next(), Some(Stage::Load));
        assert_eq!(Stage::Load.next(), Some(Stage::Vectorize));
        assert_eq!(Stage::Vectorize.next(), None);
    }

    #[test]
    fn completion_percents_follow_the_five_checkpoint_model() {
        let percents: Vec<u8> = Stage::ALL.iter().map(|s| s.completion_percent()).collect();
        assert_eq!(percents, vec![20, 40, 60, 80]);
    }

    #[test]
    fn requeue_increments_attempt_count_and_keeps_identity() {
        let msg = PipelineMessage::new("sync-a", Stage::Transform, serde_json::json!({"id": 7}));
        let retried = msg.requeued();
        assert_eq!(retried.attempt_count, 1);
        assert_eq!(retried.id, msg.id);
        assert_eq!(retried.payload, msg.payload);
        assert_eq!(retried.stage, msg.stage);
    }

    #[test]
    fn stage_serializes_as_snake_case() {
        assert_eq!(serde_json::to_string(&Stage::Vectorize).unwrap(), "\"vectorize\"");
        assert_eq!(Stage::Extract.to_string(), "extract");
    }
}
