use axum::extract::State;
use axum::response::IntoResponse;

use crate::app_state::AppState;

/// GET /metrics — Prometheus text exposition of the engine's counters
/// (jobs completed/failed, messages processed/dead-lettered), the queue
/// depth gauge, and the job duration histogram.
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}
