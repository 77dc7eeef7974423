//! Builder and build handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use kiln_core::build::{BuildReason, BuildResult, StepReport};
use kiln_core::builder::BuilderConfig;
use kiln_core::ids::BuilderName;
use kiln_core::Error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::middleware::authorize_operator;
use crate::state::AppState;

#[derive(Serialize)]
pub struct BuilderResponse {
    pub name: String,
    pub platform: String,
    pub arch: String,
    pub tags: Vec<String>,
    pub steps: Vec<String>,
    pub max_duration_secs: u64,
}

impl From<&BuilderConfig> for BuilderResponse {
    fn from(config: &BuilderConfig) -> Self {
        Self {
            name: config.name.to_string(),
            platform: config.requires.platform.as_str().to_string(),
            arch: config.requires.arch.as_str().to_string(),
            tags: config.requires.tags.clone(),
            steps: config.steps.iter().map(|s| s.name.clone()).collect(),
            max_duration_secs: config.max_duration_secs,
        }
    }
}

#[derive(Serialize)]
pub struct ListBuildersResponse {
    pub builders: Vec<BuilderResponse>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct BuildResponse {
    pub builder: String,
    pub number: u32,
    pub request_id: String,
    pub reason: BuildReason,
    pub outcome: String,
    pub worker: Option<String>,
    pub steps: Vec<StepReport>,
    pub logs_ref: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: String,
}

impl From<&BuildResult> for BuildResponse {
    fn from(result: &BuildResult) -> Self {
        Self {
            builder: result.builder.to_string(),
            number: result.number,
            request_id: result.request_id.to_string(),
            reason: result.reason.clone(),
            outcome: result.outcome.as_str().to_string(),
            worker: result.worker.clone(),
            steps: result.steps.clone(),
            logs_ref: result.logs_ref.clone(),
            started_at: result.started_at.map(|t| t.to_rfc3339()),
            completed_at: result.completed_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct ListBuildsResponse {
    pub builds: Vec<BuildResponse>,
    pub total: usize,
}

#[derive(Deserialize)]
pub struct ListBuildsParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

#[derive(Serialize)]
pub struct ForceBuildResponse {
    pub request_id: String,
}

pub async fn list_builders(State(state): State<Arc<AppState>>) -> Json<ListBuildersResponse> {
    let builders: Vec<BuilderResponse> = state.builders.iter().map(BuilderResponse::from).collect();
    Json(ListBuildersResponse {
        total: builders.len(),
        builders,
    })
}

pub async fn get_builder(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<BuilderResponse>, (StatusCode, String)> {
    let builder = state
        .builders
        .get(&BuilderName::from(name.as_str()))
        .ok_or((StatusCode::NOT_FOUND, "Unknown builder".to_string()))?;
    Ok(Json(BuilderResponse::from(builder)))
}

pub async fn list_builds(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<ListBuildsParams>,
) -> Result<Json<ListBuildsResponse>, (StatusCode, String)> {
    let builder = BuilderName::from(name.as_str());
    if !state.builders.contains(&builder) {
        return Err((StatusCode::NOT_FOUND, "Unknown builder".to_string()));
    }

    let results = state
        .store
        .list_recent(&builder, params.limit.min(100), params.offset)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let builds: Vec<BuildResponse> = results.iter().map(BuildResponse::from).collect();
    Ok(Json(ListBuildsResponse {
        total: builds.len(),
        builds,
    }))
}

pub async fn get_build(
    State(state): State<Arc<AppState>>,
    Path((name, number)): Path<(String, u32)>,
) -> Result<Json<BuildResponse>, (StatusCode, String)> {
    let builder = BuilderName::from(name.as_str());
    if !state.builders.contains(&builder) {
        return Err((StatusCode::NOT_FOUND, "Unknown builder".to_string()));
    }

    let result = state
        .store
        .get(&builder, number)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "Unknown build".to_string()))?;

    Ok(Json(BuildResponse::from(&result)))
}

pub async fn force_build(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
) -> Result<(StatusCode, Json<ForceBuildResponse>), (StatusCode, String)> {
    let username = authorize_operator(&state, auth.as_ref())?;

    match state
        .scheduler
        .force_build(&BuilderName::from(name.as_str()), &username)
        .await
    {
        Ok(request_id) => Ok((
            StatusCode::CREATED,
            Json(ForceBuildResponse {
                request_id: request_id.to_string(),
            }),
        )),
        Err(Error::UnknownBuilder(_)) => {
            Err((StatusCode::NOT_FOUND, "Unknown builder".to_string()))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
