//! In-memory stage queues for tests and embedded use. Same contract as the
//! Redis backend: pending/processing lists per stage plus a dead-letter
//! list.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::QueueError;
use crate::models::message::{PipelineMessage, Stage};

use super::{DeadLetter, StageQueue};

#[derive(Default)]
struct StageState {
    pending: VecDeque<PipelineMessage>,
    processing: Vec<PipelineMessage>,
    dead: Vec<DeadLetter>,
}

#[derive(Default)]
pub struct MemoryStageQueue {
    stages: Mutex<HashMap<Stage, StageState>>,
}

impl MemoryStageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently dequeued but neither acked, requeued, nor
    /// dead-lettered. Exposed for crash-replay tests.
    pub async fn processing(&self, stage: Stage) -> Vec<PipelineMessage> {
        let mut stages = self.stages.lock().await;
        stages.entry(stage).or_default().processing.clone()
    }
}

#[async_trait]
impl StageQueue for MemoryStageQueue {
    async fn enqueue(&self, msg: &PipelineMessage) -> Result<(), QueueError> {
        let mut stages = self.stages.lock().await;
        stages.entry(msg.stage).or_default().pending.push_back(msg.clone());
        Ok(())
    }

    async fn dequeue(&self, stage: Stage) -> Result<Option<PipelineMessage>, QueueError> {
        let mut stages = self.stages.lock().await;
        let state = stages.entry(stage).or_default();
        match state.pending.pop_front() {
            Some(msg) => {
                state.processing.push(msg.clone());
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, msg: &PipelineMessage) -> Result<(), QueueError> {
        let mut stages = self.stages.lock().await;
        let state = stages.entry(msg.stage).or_default();
        if let Some(pos) = state.processing.iter().position(|m| m.id == msg.id) {
            state.processing.remove(pos);
        }
        Ok(())
    }

    async fn requeue(&self, msg: &PipelineMessage) -> Result<(), QueueError> {
        let mut stages = self.stages.lock().await;
        let state = stages.entry(msg.stage).or_default();
        if let Some(pos) = state.processing.iter().position(|m| m.id == msg.id) {
            state.processing.remove(pos);
        }
        state.pending.push_back(msg.requeued());
        Ok(())
    }

    async fn dead_letter(&self, msg: &PipelineMessage, error: &str) -> Result<(), QueueError> {
        let mut stages = self.stages.lock().await;
        let state = stages.entry(msg.stage).or_default();
        if let Some(pos) = state.processing.iter().position(|m| m.id == msg.id) {
            state.processing.remove(pos);
        }
        state.dead.push(DeadLetter::new(msg.clone(), error));
        Ok(())
    }

    async fn depth(&self, stage: Stage) -> Result<u64, QueueError> {
        let mut stages = self.stages.lock().await;
        Ok(stages.entry(stage).or_default().pending.len() as u64)
    }

    async fn recover(&self, stage: Stage) -> Result<u64, QueueError> {
        let mut stages = self.stages.lock().await;
        let state = stages.entry(stage).or_default();
        let recovered = state.processing.len() as u64;
        let stranded: Vec<PipelineMessage> = state.processing.drain(..).collect();
        state.pending.extend(stranded);
        Ok(recovered)
    }

    async fn dead_letters(&self, stage: Stage) -> Result<Vec<DeadLetter>, QueueError> {
        let mut stages = self.stages.lock().await;
        Ok(stages.entry(stage).or_default().dead.clone())
    }
}
