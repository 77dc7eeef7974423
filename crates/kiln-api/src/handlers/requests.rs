//! Live build request handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use kiln_core::ids::RequestId;
use kiln_core::Error;
use kiln_scheduler::dispatch::RequestSnapshot;
use serde::Serialize;
use std::sync::Arc;

use crate::middleware::authorize_operator;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ListRequestsResponse {
    pub requests: Vec<RequestSnapshot>,
    pub total: usize,
}

pub async fn list_requests(State(state): State<Arc<AppState>>) -> Json<ListRequestsResponse> {
    let requests = state.dispatcher.snapshot().await;
    Json(ListRequestsResponse {
        total: requests.len(),
        requests,
    })
}

pub async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
) -> Result<StatusCode, (StatusCode, String)> {
    let username = authorize_operator(&state, auth.as_ref())?;

    let request_id: RequestId = id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid request ID".to_string()))?;

    match state.dispatcher.cancel(request_id, &username).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(Error::RequestNotFound(_)) => {
            Err((StatusCode::NOT_FOUND, "Request not found".to_string()))
        }
        Err(Error::RequestAlreadyFinished(_)) => Err((
            StatusCode::CONFLICT,
            "Request already finished".to_string(),
        )),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
