// Org credit balances

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::common::ApiError;
use super::AppState;

/// Request to add credit
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreditRequest {
    #[schema(example = 500)]
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub org_id: String,
    pub balance: u64,
}

/// Create credit routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/orgs/:org_id/credits", get(get_balance).post(add_credit))
        .with_state(state)
}

/// GET /v1/orgs/{org_id}/credits - Current balance
#[utoipa::path(
    get,
    path = "/v1/orgs/{org_id}/credits",
    params(("org_id" = String, Path, description = "Org ID")),
    responses(
        (status = 200, description = "Balance", body = BalanceResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "credits"
)]
pub async fn get_balance(
    State(state): State<AppState>,
    Path(org_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.engine.balance(&org_id).await?;
    Ok(Json(BalanceResponse { org_id, balance }))
}

/// POST /v1/orgs/{org_id}/credits - Top up a balance
#[utoipa::path(
    post,
    path = "/v1/orgs/{org_id}/credits",
    params(("org_id" = String, Path, description = "Org ID")),
    request_body = CreditRequest,
    responses(
        (status = 200, description = "New balance", body = BalanceResponse),
        (status = 400, description = "Amount is zero")
    ),
    tag = "credits"
)]
pub async fn add_credit(
    State(state): State<AppState>,
    Path(org_id): Path<String>,
    Json(req): Json<CreditRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    if req.amount == 0 {
        return Err(ApiError::bad_request("amount must be positive"));
    }
    let balance = state.engine.credit(&org_id, req.amount).await?;
    tracing::info!(%org_id, amount = req.amount, balance, "credit added");
    Ok(Json(BalanceResponse { org_id, balance }))
}
