//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod engine_action;
mod process;
mod step;

use crate::caller::caller_middleware;
use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    extract::State,
    http::{header, HeaderName, Method},
    middleware::from_fn,
    routing::{get, post, put},
    Json, Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Process routes
        .route("/api/processes", post(process::create_process).get(process::list_processes))
        .route("/api/processes/initiate", post(engine_action::initiate_process))
        .route(
            "/api/processes/{guid}",
            get(process::get_process)
                .put(process::update_process)
                .delete(process::delete_process),
        )
        .route("/api/processes/{guid}/publish", post(process::publish_process))
        .route("/api/processes/{guid}/withdraw", post(process::withdraw_process))
        .route(
            "/api/processes/{guid}/first-step",
            get(process::get_first_step)
                .put(process::set_first_step)
                .delete(process::remove_first_step),
        )
        .route("/api/processes/{guid}/validate", get(process::validate_process))

        // Step and link routes
        .route("/api/steps", post(step::create_step))
        .route(
            "/api/steps/{guid}",
            get(step::get_step).put(step::update_step).delete(step::delete_step),
        )
        .route(
            "/api/steps/{guid}/next-steps",
            get(step::get_next_steps).post(step::add_next_step),
        )
        .route("/api/links/{guid}", put(step::update_link).delete(step::remove_link))

        // Engine action routes
        .route(
            "/api/engine-actions",
            post(engine_action::initiate_engine_action).get(engine_action::list_engine_actions),
        )
        .route("/api/engine-actions/{guid}", get(engine_action::get_engine_action))
        .route("/api/engine-actions/{guid}/claim", post(engine_action::claim_engine_action))
        .route("/api/engine-actions/{guid}/status", put(engine_action::update_status))
        .route("/api/engine-actions/{guid}/complete", post(engine_action::complete_engine_action))
        .route("/api/engine-actions/{guid}/cancel", post(engine_action::cancel_engine_action))
        .route("/api/request-types", get(list_request_types))

        // Apply middleware and state
        .layer(from_fn(caller_middleware))
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let caller = HeaderName::from_static(crate::caller::CALLER_HEADER);
    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        CorsLayer::new().allow_origin(origins)
    };

    cors.allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, caller])
        .max_age(Duration::from_secs(3600))
}

/// Health check endpoint
async fn health_check(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let store = if state.settings.database.is_some() { "postgres" } else { "memory" };
    Json(serde_json::json!({
        "success": true,
        "message": "Governance engine is running.",
        "engineGuid": state.settings.engine.engine_guid,
        "store": store,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Request types with a registered governance service
async fn list_request_types(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "message": "Registered request types",
        "data": state.services.request_types(),
    }))
}
