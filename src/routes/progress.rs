//! Live job-progress feed.
//!
//! Streams [`ProgressUpdate`]s to WebSocket clients as JSON, one message per
//! update. The feed is best-effort: a client that lags far enough to drop
//! broadcast slots just misses those updates.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::broadcast;

use crate::app_state::AppState;
use crate::progress::ProgressUpdate;

/// GET /api/v1/progress — upgrade to a WebSocket progress stream.
pub async fn progress_stream(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state.progress.subscribe();
    ws.on_upgrade(move |socket| forward_updates(socket, rx))
}

async fn forward_updates(mut socket: WebSocket, mut rx: broadcast::Receiver<ProgressUpdate>) {
    loop {
        match rx.recv().await {
            Ok(update) => {
                let Ok(text) = serde_json::to_string(&update) else {
                    continue;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "progress subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
