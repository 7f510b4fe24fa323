use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use super::{ok, ApiResponse};
use crate::errors::AppError;
use crate::execution::{CommandPreview, ExecutionReport};
use crate::models::{Command, CommandRequest, DispatchOutcome};
use crate::AppState;

/// GET /api/commands: audit list, oldest first.
pub async fn list(State(state): State<AppState>) -> Json<ApiResponse<Vec<Command>>> {
    ok(state.queue.list().await)
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Command>>, AppError> {
    state
        .queue
        .get(id)
        .await
        .map(ok)
        .ok_or_else(|| AppError::NotFound(format!("command {id} not found")))
}

/// POST /api/commands: admit into the queue. 202: delivery happens later.
pub async fn enqueue(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Command>>), AppError> {
    let command = state.dispatcher.enqueue(&req).await?;
    tracing::info!(
        command_id = %command.id,
        command = command.kind.name(),
        target = %command.selector,
        targets = command.targets.len(),
        "Command queued via API"
    );
    Ok((StatusCode::ACCEPTED, ok(command)))
}

/// POST /api/commands/execute: deliver now. The status code tells the
/// three outcomes apart: 200 all delivered, 207 partial, 502 none.
pub async fn execute(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ExecutionReport>>), AppError> {
    let report = state.dispatcher.execute_now(&req).await?;
    let status = match report.outcome {
        DispatchOutcome::AllSucceeded => StatusCode::OK,
        DispatchOutcome::Partial => StatusCode::MULTI_STATUS,
        DispatchOutcome::AllFailed => StatusCode::BAD_GATEWAY,
    };
    Ok((status, ok(report)))
}

pub async fn preview(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<ApiResponse<CommandPreview>>, AppError> {
    Ok(ok(state.dispatcher.preview(&req).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Command>>, AppError> {
    let command = state.dispatcher.cancel(id).await?;
    tracing::info!(command_id = %id, "Command cancelled via API");
    Ok(ok(command))
}
