use axum::{
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::RequestBodyTimeoutLayer,
    trace::TraceLayer,
};

use crate::handlers::{events, health};
use crate::AppState;

/// Create the router for the liveness and ingestion endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_body_bytes;
    let body_timeout = state.config.body_read_timeout();
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health::banner))
        .route("/healthz", get(health::healthz))
        .route("/api/events/health", get(health::health_check))
        .route("/api/events/metrics", get(health::metrics))
        // Method checks live in the handler so every rejection has a JSON body
        .route("/api/events/:event_type", any(events::publish_event))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(RequestBodyTimeoutLayer::new(body_timeout))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
