//! API route definitions.

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::handlers::{badge, builders, changes, health, requests, workers};
use crate::state::AppState;
use crate::ws;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/status/badge", get(badge::badge))
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/ws/worker", get(ws::worker_handler))
        .route("/ws/events", get(ws::events_handler))
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/builders", builder_routes())
        .nest("/changes", change_routes())
        .nest("/requests", request_routes())
        .nest("/workers", worker_routes())
}

fn builder_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(builders::list_builders))
        .route("/{name}", get(builders::get_builder))
        .route("/{name}/builds", get(builders::list_builds))
        .route("/{name}/builds/{number}", get(builders::get_build))
        .route("/{name}/force", post(builders::force_build))
}

fn change_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(changes::submit_change))
}

fn request_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(requests::list_requests))
        .route("/{id}/cancel", post(requests::cancel_request))
}

fn worker_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", get(workers::list_workers))
}
