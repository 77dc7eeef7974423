//! Health check handlers.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub title: String,
    pub external_url: Option<String>,
    pub version: String,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        title: state.config.title.clone(),
        external_url: state.config.external_url.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn ready() -> StatusCode {
    StatusCode::OK
}
