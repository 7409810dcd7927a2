use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;

use crate::progress::ProgressBroadcaster;
use crate::queue::RedisStageQueue;
use crate::scheduler::OrchestratorHandle;

/// Shared state for the admin/observation routes.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<RedisStageQueue>,
    pub orchestrator: OrchestratorHandle,
    pub progress: ProgressBroadcaster,
    pub metrics: Arc<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queue: Arc<RedisStageQueue>,
        orchestrator: OrchestratorHandle,
        progress: ProgressBroadcaster,
        metrics: Arc<PrometheusHandle>,
    ) -> Self {
        Self {
            db,
            queue,
            orchestrator,
            progress,
            metrics,
        }
    }
}
