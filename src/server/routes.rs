//! Route definitions for the API server

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::state::AppState;

/// Creates the main application router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        // Panel sessions
        .route("/sessions", post(handlers::create_session))
        .route(
            "/sessions/:session_id",
            get(handlers::get_session).delete(handlers::close_session),
        )
        .route(
            "/sessions/:session_id/application",
            put(handlers::select_application),
        )
        .route("/sessions/:session_id/reload", post(handlers::reload_experiments))
        .route("/sessions/:session_id/selection", post(handlers::select_experiment))
        .route("/sessions/:session_id/refresh", post(handlers::refresh))
        .route(
            "/sessions/:session_id/notices",
            delete(handlers::acknowledge_notices),
        )
        .route("/sessions/:session_id/table.csv", get(handlers::export_table))
        // SSE streaming
        .route("/sessions/:session_id/stream", get(handlers::handle_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
