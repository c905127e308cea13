// Run inspection and cancellation

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use flowline_engine::engine::RunReport;
use flowline_engine::WorkflowRun;
use uuid::Uuid;

use super::common::ApiError;
use super::AppState;

/// Create run routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/runs/:id", get(get_run))
        .route("/v1/runs/:id/cancel", post(cancel_run))
        .with_state(state)
}

/// GET /v1/runs/{id} - Run with its steps and what it is blocked on
#[utoipa::path(
    get,
    path = "/v1/runs/{id}",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run report"),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunReport>, ApiError> {
    Ok(Json(state.engine.inspect_run(id).await?))
}

/// POST /v1/runs/{id}/cancel - Cancel a run
#[utoipa::path(
    post,
    path = "/v1/runs/{id}/cancel",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run cancelled, or already finished"),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowRun>, ApiError> {
    Ok(Json(state.engine.cancel_run(id).await?))
}
