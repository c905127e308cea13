// Event intake: turns external events into runs

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use flowline_engine::engine::DispatchedRun;
use flowline_engine::TriggerEvent;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::ApiError;
use super::AppState;

/// Header carrying the event source's delivery id
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Request to dispatch an event
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct DispatchRequest {
    /// Event payload, stored in the run context under the trigger node id.
    #[serde(default)]
    #[schema(example = json!({"form_id": "signup", "email": "ada@example.com"}))]
    pub payload: serde_json::Value,
    /// Delivery id from the event source. Redelivery with the same key
    /// resolves to the run created the first time.
    #[serde(default)]
    #[schema(example = "whk_01J9Z")]
    pub idempotency_key: Option<String>,
    /// Only match definitions of this org.
    #[serde(default)]
    pub org_id: Option<String>,
}

/// Runs resolved for an event
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DispatchResponse {
    /// One run per matching active definition; empty when nothing matched.
    pub run_ids: Vec<Uuid>,
    /// How many of the runs were created by this request.
    pub created: usize,
}

impl From<Vec<DispatchedRun>> for DispatchResponse {
    fn from(runs: Vec<DispatchedRun>) -> Self {
        Self {
            created: runs.iter().filter(|r| r.created).count(),
            run_ids: runs.into_iter().map(|r| r.run_id).collect(),
        }
    }
}

/// Create event routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/events/:event_kind", post(dispatch_event))
        .with_state(state)
}

/// POST /v1/events/{event_kind} - Dispatch an event
#[utoipa::path(
    post,
    path = "/v1/events/{event_kind}",
    params(("event_kind" = String, Path, description = "Event kind, e.g. form_submitted")),
    request_body = DispatchRequest,
    responses(
        (status = 202, description = "Event accepted", body = DispatchResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "events"
)]
pub async fn dispatch_event(
    State(state): State<AppState>,
    Path(event_kind): Path<String>,
    headers: HeaderMap,
    body: Option<Json<DispatchRequest>>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let header_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut event = TriggerEvent::new(event_kind, req.payload);
    if let Some(key) = req.idempotency_key.or(header_key) {
        event = event.with_idempotency_key(key);
    }
    if let Some(org_id) = req.org_id {
        event = event.for_org(org_id);
    }

    let outcome = state.engine.dispatch(&event).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome.runs.into())))
}
