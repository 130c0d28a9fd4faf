mod push;
mod system;

use axum::{
    Json,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
};
use serde_json::{Value, json};
use syspulse_proto::{Snapshot, msg::ErrorResp};
use tracing::{Instrument, debug, debug_span, error};

use crate::{AppState, sampler::Sampled};

pub use system::{restart, shutdown};

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// One snapshot for first paint.
pub async fn index(
    State(state): State<AppState>,
) -> Result<Json<Snapshot>, (StatusCode, Json<ErrorResp>)> {
    let Sampled { snapshot, degraded } = state.sampler.sample_blocking().await.map_err(|e| {
        error!("sampling task failed: {e}");
        let error = "failed to sample host".to_owned();
        (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResp { error }))
    })?;
    for e in degraded {
        debug!("degraded snapshot: {e}");
    }
    Ok(Json(snapshot))
}

pub async fn push_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| {
        push::handle_socket(socket, state).instrument(debug_span!("push_ws"))
    })
}
