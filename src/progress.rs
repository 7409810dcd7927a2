//! Fire-and-forget progress fan-out.
//!
//! The runner publishes a fixed five-checkpoint percentage model per job
//! (20/40/60/80 at stage boundaries, 100 at completion). Observers come and
//! go; a lagging or absent observer never fails the job.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::message::Stage;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub job_name: String,
    pub stage: Stage,
    pub percent: u8,
    pub detail: String,
}

#[derive(Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressUpdate>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }

    /// Publish one update. Send errors (no subscribers) are deliberately
    /// ignored: delivery is best-effort.
    pub fn publish(&self, job_name: &str, stage: Stage, percent: u8, detail: &str) {
        let update = ProgressUpdate {
            job_name: job_name.to_string(),
            stage,
            percent,
            detail: detail.to_string(),
        };
        tracing::debug!(
            job_name = %update.job_name,
            stage = %update.stage,
            percent = update.percent,
            detail = %update.detail,
            "progress"
        );
        let _ = self.tx.send(update);
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_updates() {
        let broadcaster = ProgressBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        broadcaster.publish("sync-a", Stage::Extract, 20, "extraction complete");

        let update = rx.recv().await.unwrap();
        assert_eq!(update.job_name, "sync-a");
        assert_eq!(update.percent, 20);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let broadcaster = ProgressBroadcaster::new(8);
        broadcaster.publish("sync-a", Stage::Load, 60, "stage complete");
    }
}
