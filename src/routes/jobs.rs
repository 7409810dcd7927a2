//! Thin admin control surface. Each action maps onto one orchestrator
//! state-machine transition; the handlers hold no job state of their own.

use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::job::Job;
use crate::models::message::Stage;
use crate::queue::{DeadLetter, StageQueue};

#[derive(Serialize)]
pub struct ActionResponse {
    pub job_name: String,
    pub action: String,
    pub accepted: bool,
}

/// GET /api/v1/jobs — current job table snapshot.
pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, StatusCode> {
    state
        .orchestrator
        .snapshot()
        .await
        .map(Json)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

/// POST /api/v1/jobs/{name}/{action} — start/stop/pause/resume a job.
pub async fn control_job(
    State(state): State<AppState>,
    Path((name, action)): Path<(String, String)>,
) -> Result<(StatusCode, Json<ActionResponse>), StatusCode> {
    let accepted = match action.as_str() {
        "start" => state.orchestrator.force_start(&name).await,
        "stop" => state.orchestrator.stop(&name).await,
        "pause" => state.orchestrator.pause(&name).await,
        "resume" => state.orchestrator.resume(&name).await,
        _ => return Err(StatusCode::NOT_FOUND),
    };

    let status = if accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((
        status,
        Json(ActionResponse {
            job_name: name,
            action,
            accepted,
        }),
    ))
}

/// GET /api/v1/stages/{stage}/dead-letters — messages that exhausted their
/// retry budget, preserved for manual inspection.
pub async fn stage_dead_letters(
    State(state): State<AppState>,
    Path(stage): Path<String>,
) -> Result<Json<Vec<DeadLetter>>, StatusCode> {
    let stage = Stage::from_str(&stage).map_err(|_| StatusCode::NOT_FOUND)?;
    state
        .queue
        .dead_letters(stage)
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}
