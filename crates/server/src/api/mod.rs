// HTTP API

pub mod common;
pub mod credits;
pub mod definitions;
pub mod events;
pub mod runs;

use axum::{routing::get, Json, Router};
use flowline_engine::Engine;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::openapi::ApiDoc;

pub use common::{ApiError, ErrorResponse, ListResponse};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Full application router: health and the OpenAPI document stay at the
/// root, versioned routes live under `api_prefix`.
pub fn router(state: AppState, api_prefix: &str) -> Router {
    let api_routes = Router::new()
        .merge(events::routes(state.clone()))
        .merge(definitions::routes(state.clone()))
        .merge(runs::routes(state.clone()))
        .merge(credits::routes(state));

    Router::new()
        .route("/health", get(health))
        .route("/api-doc/openapi.json", get(openapi_json))
        .merge(build_router_with_prefix(api_routes, api_prefix))
        .layer(TraceLayer::new_for_http())
}

/// Build router with optional API prefix
pub fn build_router_with_prefix<S: Clone + Send + Sync + 'static>(
    api_routes: Router<S>,
    api_prefix: &str,
) -> Router<S> {
    if api_prefix.is_empty() {
        api_routes
    } else {
        Router::new().nest(api_prefix, api_routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use flowline_engine::{BehaviorRegistry, InMemoryCreditLedger, InMemoryWorkflowStore};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_engine() -> Engine {
        let mut behaviors = BehaviorRegistry::new();
        behaviors.register_fn("send_email", |ctx| async move {
            Ok(json!({ "sent_to": ctx.param_str("to").unwrap_or_default() }))
        });
        Engine::builder(Arc::new(InMemoryWorkflowStore::new()))
            .behaviors(behaviors)
            .ledger(Arc::new(InMemoryCreditLedger::with_default_balance(10)))
            .build()
    }

    fn test_app(engine: Engine) -> Router {
        router(AppState::new(engine), "")
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn welcome_graph() -> Value {
        json!({
            "nodes": [
                { "id": "start", "kind": "trigger_event" },
                {
                    "id": "send",
                    "kind": "action",
                    "config": { "behavior": "send_email", "params": { "to": "{{ start.email }}" } },
                    "terminal": true
                }
            ],
            "edges": [
                { "id": "e1", "source_node_id": "start", "target_node_id": "send" }
            ],
            "triggers": [
                { "node_id": "start", "type": "event", "event_kind": "signup" }
            ]
        })
    }

    /// Create, save and activate the welcome graph; returns the definition id
    async fn activate_welcome(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/definitions",
                json!({ "org_id": "org_1", "name": "Welcome" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(json_request("PUT", &format!("/v1/definitions/{id}"), welcome_graph()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/v1/definitions/{id}/status"),
                json!({ "status": "active" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "active");
        id
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_app(test_engine())
            .oneshot(get_request("/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_openapi_document_lists_routes() {
        let response = test_app(test_engine())
            .oneshot(get_request("/api-doc/openapi.json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = body_json(response).await;
        assert!(doc["paths"]["/v1/events/{event_kind}"].is_object());
        assert!(doc["paths"]["/v1/runs/{id}"].is_object());
    }

    #[tokio::test]
    async fn test_event_runs_workflow_end_to_end() {
        let engine = test_engine();
        let app = test_app(engine.clone());
        activate_welcome(&app).await;

        let request = Request::builder()
            .method("POST")
            .uri("/v1/events/signup")
            .header("content-type", "application/json")
            .header("idempotency-key", "delivery-1")
            .body(Body::from(
                json!({ "payload": { "email": "ada@example.com" } }).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let dispatched = body_json(response).await;
        assert_eq!(dispatched["created"], 1);
        let run_id = dispatched["run_ids"][0].as_str().unwrap().to_string();

        // Redelivery resolves to the same run
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/events/signup",
                json!({ "payload": { "email": "ada@example.com" }, "idempotency_key": "delivery-1" }),
            ))
            .await
            .unwrap();
        let again = body_json(response).await;
        assert_eq!(again["created"], 0);
        assert_eq!(again["run_ids"][0], run_id.as_str());

        engine.run_until_idle().await.unwrap();

        let response = app
            .clone()
            .oneshot(get_request(&format!("/v1/runs/{run_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["run"]["status"], "completed");
        assert_eq!(
            report["run"]["context"]["send"]["sent_to"],
            "ada@example.com"
        );

        let response = app
            .oneshot(get_request("/v1/orgs/org_1/credits"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["balance"], 9);
    }

    #[tokio::test]
    async fn test_unmatched_event_accepted_without_runs() {
        let response = test_app(test_engine())
            .oneshot(json_request("POST", "/v1/events/nobody_listens", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["run_ids"], json!([]));
        assert_eq!(body["created"], 0);
    }

    #[tokio::test]
    async fn test_activating_empty_definition_returns_violations() {
        let app = test_app(test_engine());
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/definitions",
                json!({ "org_id": "org_1", "name": "Empty" }),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/v1/definitions/{id}/status"),
                json!({ "status": "active" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(!body["violations"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_definition_is_not_editable() {
        let app = test_app(test_engine());
        let id = activate_welcome(&app).await;

        let response = app
            .clone()
            .oneshot(json_request("PUT", &format!("/v1/definitions/{id}"), welcome_graph()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(get_request("/v1/definitions?org_id=org_1"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let app = test_app(test_engine());
        let missing = uuid::Uuid::now_v7();

        let response = app
            .clone()
            .oneshot(get_request(&format!("/v1/runs/{missing}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(json_request("POST", &format!("/v1/runs/{missing}/cancel"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_credit_top_up() {
        let app = test_app(test_engine());

        let response = app
            .clone()
            .oneshot(json_request("POST", "/v1/orgs/org_9/credits", json!({ "amount": 5 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["balance"], 15);

        let response = app
            .oneshot(json_request("POST", "/v1/orgs/org_9/credits", json!({ "amount": 0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_api_prefix_set() {
        let app = router(AppState::new(test_engine()), "/api");

        let response = app
            .clone()
            .oneshot(get_request("/api/v1/orgs/org_1/credits"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(get_request("/v1/orgs/org_1/credits"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Health is never prefixed
        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
