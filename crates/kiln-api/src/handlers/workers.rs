//! Worker fleet handlers.

use axum::{Json, extract::State};
use kiln_core::worker::Worker;
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct WorkerResponse {
    pub name: String,
    pub platform: String,
    pub arch: String,
    pub tags: Vec<String>,
    pub status: String,
    pub version: Option<String>,
    pub current_request_id: Option<String>,
    pub registered_at: String,
    pub last_heartbeat_at: Option<String>,
}

impl From<&Worker> for WorkerResponse {
    fn from(worker: &Worker) -> Self {
        Self {
            name: worker.name.clone(),
            platform: worker.capabilities.platform.as_str().to_string(),
            arch: worker.capabilities.arch.as_str().to_string(),
            tags: worker.capabilities.tags.clone(),
            status: format!("{:?}", worker.status).to_lowercase(),
            version: worker.version.clone(),
            current_request_id: worker.current_request_id.map(|id| id.to_string()),
            registered_at: worker.registered_at.to_rfc3339(),
            last_heartbeat_at: worker.last_heartbeat_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
pub struct ListWorkersResponse {
    pub workers: Vec<WorkerResponse>,
    pub total: usize,
}

pub async fn list_workers(State(state): State<Arc<AppState>>) -> Json<ListWorkersResponse> {
    let workers: Vec<WorkerResponse> = state
        .registry
        .list()
        .await
        .iter()
        .map(WorkerResponse::from)
        .collect();
    Json(ListWorkersResponse {
        total: workers.len(),
        workers,
    })
}
