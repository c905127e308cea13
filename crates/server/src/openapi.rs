// OpenAPI document for the Flowline HTTP API

use crate::api;
use utoipa::OpenApi;

/// OpenAPI documentation for the Flowline API
#[derive(OpenApi)]
#[openapi(
    paths(
        api::events::dispatch_event,
        api::definitions::create_definition,
        api::definitions::list_definitions,
        api::definitions::get_definition,
        api::definitions::save_definition,
        api::definitions::set_status,
        api::runs::get_run,
        api::runs::cancel_run,
        api::credits::get_balance,
        api::credits::add_credit,
    ),
    components(
        schemas(
            api::common::ErrorResponse,
            api::events::DispatchRequest, api::events::DispatchResponse,
            api::definitions::CreateDefinitionRequest, api::definitions::SetStatusRequest,
            api::credits::CreditRequest, api::credits::BalanceResponse,
        )
    ),
    tags(
        (name = "events", description = "Event intake"),
        (name = "definitions", description = "Workflow definition lifecycle"),
        (name = "runs", description = "Run inspection and cancellation"),
        (name = "credits", description = "Org credit balances")
    ),
    info(
        title = "Flowline API",
        description = "Durable execution of visual-builder workflows",
    )
)]
pub struct ApiDoc;
