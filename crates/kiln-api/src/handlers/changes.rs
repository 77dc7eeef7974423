//! Change notification handlers.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use kiln_core::change::RawChange;
use kiln_core::Error;
use serde::Serialize;
use std::sync::Arc;

use crate::middleware::authorize_operator;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ChangeAcceptedResponse {
    pub change_id: String,
    pub branch: String,
    pub revision: String,
    pub requests: Vec<String>,
}

pub async fn submit_change(
    State(state): State<Arc<AppState>>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
    Json(raw): Json<RawChange>,
) -> Result<(StatusCode, Json<ChangeAcceptedResponse>), (StatusCode, String)> {
    authorize_operator(&state, auth.as_ref())?;

    match state.ingest.submit(raw).await {
        Ok((change, requests)) => Ok((
            StatusCode::ACCEPTED,
            Json(ChangeAcceptedResponse {
                change_id: change.id.to_string(),
                branch: change.branch,
                revision: change.revision,
                requests: requests.iter().map(|id| id.to_string()).collect(),
            }),
        )),
        Err(err @ Error::MalformedChange { .. }) => {
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
