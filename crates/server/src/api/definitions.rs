// Definition lifecycle HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use flowline_engine::definition::{DefinitionGraph, NewDefinition};
use flowline_engine::{DefinitionStatus, WorkflowDefinition};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::{ApiError, ListResponse};
use super::AppState;

/// Request to create an empty draft definition
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateDefinitionRequest {
    #[schema(example = "org_42")]
    pub org_id: String,
    #[schema(example = "Welcome series")]
    pub name: String,
}

/// Request to move a definition to another status
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SetStatusRequest {
    /// One of draft, ready, active, paused, error, archived.
    #[schema(value_type = String, example = "active")]
    pub status: DefinitionStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListDefinitionsQuery {
    pub org_id: Option<String>,
}

/// Create definition routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/definitions", post(create_definition).get(list_definitions))
        .route("/v1/definitions/:id", get(get_definition).put(save_definition))
        .route("/v1/definitions/:id/status", post(set_status))
        .with_state(state)
}

/// POST /v1/definitions - Create a draft definition
#[utoipa::path(
    post,
    path = "/v1/definitions",
    request_body = CreateDefinitionRequest,
    responses(
        (status = 201, description = "Definition created"),
        (status = 500, description = "Internal server error")
    ),
    tag = "definitions"
)]
pub async fn create_definition(
    State(state): State<AppState>,
    Json(req): Json<CreateDefinitionRequest>,
) -> Result<(StatusCode, Json<WorkflowDefinition>), ApiError> {
    if req.org_id.trim().is_empty() {
        return Err(ApiError::bad_request("org_id must not be empty"));
    }
    let def = state
        .engine
        .definitions()
        .create(NewDefinition {
            org_id: req.org_id,
            name: req.name,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(def)))
}

/// GET /v1/definitions - List definitions, optionally for one org
#[utoipa::path(
    get,
    path = "/v1/definitions",
    params(("org_id" = Option<String>, Query, description = "Only this org's definitions")),
    responses(
        (status = 200, description = "Definitions"),
        (status = 500, description = "Internal server error")
    ),
    tag = "definitions"
)]
pub async fn list_definitions(
    State(state): State<AppState>,
    Query(query): Query<ListDefinitionsQuery>,
) -> Result<Json<ListResponse<WorkflowDefinition>>, ApiError> {
    let defs = state
        .engine
        .definitions()
        .list(query.org_id.as_deref())
        .await?;
    Ok(Json(defs.into()))
}

/// GET /v1/definitions/{id} - Get a definition
#[utoipa::path(
    get,
    path = "/v1/definitions/{id}",
    params(("id" = Uuid, Path, description = "Definition ID")),
    responses(
        (status = 200, description = "Definition found"),
        (status = 404, description = "Definition not found")
    ),
    tag = "definitions"
)]
pub async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    Ok(Json(state.engine.definitions().get(id).await?))
}

/// PUT /v1/definitions/{id} - Replace the graph of a draft or ready definition
#[utoipa::path(
    put,
    path = "/v1/definitions/{id}",
    params(("id" = Uuid, Path, description = "Definition ID")),
    request_body = Object,
    responses(
        (status = 200, description = "Graph saved, definition back in draft"),
        (status = 404, description = "Definition not found"),
        (status = 409, description = "Definition is not editable"),
        (status = 422, description = "Unknown behaviors or malformed node configs")
    ),
    tag = "definitions"
)]
pub async fn save_definition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(graph): Json<DefinitionGraph>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    Ok(Json(state.engine.definitions().save(id, graph).await?))
}

/// POST /v1/definitions/{id}/status - Change definition status
#[utoipa::path(
    post,
    path = "/v1/definitions/{id}/status",
    params(("id" = Uuid, Path, description = "Definition ID")),
    request_body = SetStatusRequest,
    responses(
        (status = 200, description = "Status changed"),
        (status = 404, description = "Definition not found"),
        (status = 409, description = "Transition not allowed"),
        (status = 422, description = "Definition failed validation")
    ),
    tag = "definitions"
)]
pub async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    Ok(Json(
        state.engine.definitions().set_status(id, req.status).await?,
    ))
}
