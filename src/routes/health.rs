use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::error::QueueError;
use crate::models::job::JobStatus;
use crate::models::message::Stage;
use crate::queue::StageQueue;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub queues: QueueHealth,
    pub orchestrator: OrchestratorHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// Redis connectivity plus per-stage pending depths, so a stuck pipeline
/// is visible straight from the health endpoint.
#[derive(Serialize)]
pub struct QueueHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
    pub depths: BTreeMap<String, u64>,
}

#[derive(Serialize)]
pub struct OrchestratorHealth {
    pub status: String,
    pub jobs: usize,
    pub running: usize,
}

async fn stage_depths(queue: &dyn StageQueue) -> Result<BTreeMap<String, u64>, QueueError> {
    let mut depths = BTreeMap::new();
    for stage in Stage::ALL {
        depths.insert(stage.to_string(), queue.depth(stage).await?);
    }
    Ok(depths)
}

/// GET /health — dependency checks plus orchestrator liveness.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_start = std::time::Instant::now();
    let database = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(db_start.elapsed().as_millis() as u64),
        },
        Err(_) => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        },
    };

    let queue_start = std::time::Instant::now();
    let queues = match stage_depths(state.queue.as_ref()).await {
        Ok(depths) => QueueHealth {
            status: "ok".to_string(),
            latency_ms: Some(queue_start.elapsed().as_millis() as u64),
            depths,
        },
        Err(_) => QueueHealth {
            status: "error".to_string(),
            latency_ms: None,
            depths: BTreeMap::new(),
        },
    };

    // A snapshot round-trip proves the actor loop is alive and answering
    // commands, not merely that its task was spawned.
    let orchestrator = match state.orchestrator.snapshot().await {
        Some(jobs) => OrchestratorHealth {
            status: "ok".to_string(),
            running: jobs.iter().filter(|j| j.status == JobStatus::Running).count(),
            jobs: jobs.len(),
        },
        None => OrchestratorHealth {
            status: "error".to_string(),
            jobs: 0,
            running: 0,
        },
    };

    let all_healthy =
        database.status == "ok" && queues.status == "ok" && orchestrator.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database,
            queues,
            orchestrator,
        },
    };

    (status_code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::PipelineMessage;
    use crate::queue::MemoryStageQueue;
    use serde_json::json;

    #[tokio::test]
    async fn stage_depths_reports_every_stage() {
        let queue = MemoryStageQueue::new();
        queue
            .enqueue(&PipelineMessage::new("sync-a", Stage::Transform, json!({})))
            .await
            .unwrap();
        queue
            .enqueue(&PipelineMessage::new("sync-a", Stage::Transform, json!({})))
            .await
            .unwrap();

        let depths = stage_depths(&queue).await.unwrap();
        assert_eq!(depths.len(), Stage::ALL.len());
        assert_eq!(depths["transform"], 2);
        assert_eq!(depths["extract"], 0);
        assert_eq!(depths["load"], 0);
        assert_eq!(depths["vectorize"], 0);
    }
}
