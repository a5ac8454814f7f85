//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Workflows
        .route(
            "/workflows",
            get(handlers::workflow::list_workflows).post(handlers::workflow::save_workflow),
        )
        .route("/workflows/{id}", get(handlers::workflow::get_workflow))
        .route(
            "/workflows/{id}/executions",
            get(handlers::workflow::list_executions).post(handlers::workflow::submit_execution),
        )
        // Executions
        .route("/executions/{id}", get(handlers::execution::get_execution))
        .route(
            "/executions/{id}/cancel",
            post(handlers::execution::cancel_execution),
        )
        .route(
            "/executions/{id}/stream",
            get(handlers::execution::stream_execution),
        )
        // Trigger ingestion
        .route(
            "/events/{provider}/{event_type}",
            post(handlers::event::ingest_event),
        )
        // Quota
        .route("/usage/{identity}", get(handlers::system::get_usage));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::system::health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
