use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use syspulse_proto::msg::{ControlAction, ControlResp, ErrorResp};
use tracing::info;

use crate::{AppState, control::ExecError};

pub async fn restart(State(state): State<AppState>) -> Result<Json<ControlResp>, ExecError> {
    execute(state, ControlAction::Restart).await
}

pub async fn shutdown(State(state): State<AppState>) -> Result<Json<ControlResp>, ExecError> {
    execute(state, ControlAction::Shutdown).await
}

async fn execute(state: AppState, action: ControlAction) -> Result<Json<ControlResp>, ExecError> {
    let ack = state.executor.execute(action).await?;
    info!(%action, "control action acknowledged");
    Ok(Json(ControlResp {
        message: ack.message,
    }))
}

impl IntoResponse for ExecError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResp {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
