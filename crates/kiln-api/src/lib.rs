//! HTTP/WebSocket master server for Kiln.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

use axum::Router;
use state::AppState;
use std::sync::Arc;

/// Assemble the full application: routes plus middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    routes::create_router(state)
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(middleware::cors_layer())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
