//! Status badge handler.
//!
//! Serves a small SVG shield for embedding in READMEs and the forum. The
//! response is never cacheable; the badge must track the latest outcome.

use axum::{
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use kiln_core::build::BuildOutcome;
use kiln_core::ids::BuilderName;
use serde::Deserialize;
use std::sync::Arc;

use crate::state::AppState;

const BADGE_PASSING: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="98" height="20"><linearGradient id="b" x2="0" y2="100%"><stop offset="0" stop-color="#bbb" stop-opacity=".1"/><stop offset="1" stop-opacity=".1"/></linearGradient><rect rx="3" width="98" height="20" fill="#555"/><rect rx="3" x="37" width="61" height="20" fill="#4c1"/><rect rx="3" width="98" height="20" fill="url(#b)"/><g fill="#fff" text-anchor="middle" font-family="DejaVu Sans,Verdana,Geneva,sans-serif" font-size="11"><text x="18.5" y="14">build</text><text x="66.5" y="14">passing</text></g></svg>"##;

const BADGE_FAILING: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="90" height="20"><linearGradient id="b" x2="0" y2="100%"><stop offset="0" stop-color="#bbb" stop-opacity=".1"/><stop offset="1" stop-opacity=".1"/></linearGradient><rect rx="3" width="90" height="20" fill="#555"/><rect rx="3" x="37" width="53" height="20" fill="#e05d44"/><rect rx="3" width="90" height="20" fill="url(#b)"/><g fill="#fff" text-anchor="middle" font-family="DejaVu Sans,Verdana,Geneva,sans-serif" font-size="11"><text x="18.5" y="14">build</text><text x="62.5" y="14">failing</text></g></svg>"##;

const BADGE_ERROR: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="82" height="20"><linearGradient id="b" x2="0" y2="100%"><stop offset="0" stop-color="#bbb" stop-opacity=".1"/><stop offset="1" stop-opacity=".1"/></linearGradient><rect rx="3" width="82" height="20" fill="#555"/><rect rx="3" x="37" width="45" height="20" fill="#fe7d37"/><rect rx="3" width="82" height="20" fill="url(#b)"/><g fill="#fff" text-anchor="middle" font-family="DejaVu Sans,Verdana,Geneva,sans-serif" font-size="11"><text x="18.5" y="14">build</text><text x="58.5" y="14">error</text></g></svg>"##;

const BADGE_CANCELLED: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="110" height="20"><linearGradient id="b" x2="0" y2="100%"><stop offset="0" stop-color="#bbb" stop-opacity=".1"/><stop offset="1" stop-opacity=".1"/></linearGradient><rect rx="3" width="110" height="20" fill="#555"/><rect rx="3" x="37" width="73" height="20" fill="#9f9f9f"/><rect rx="3" width="110" height="20" fill="url(#b)"/><g fill="#fff" text-anchor="middle" font-family="DejaVu Sans,Verdana,Geneva,sans-serif" font-size="11"><text x="18.5" y="14">build</text><text x="72.5" y="14">cancelled</text></g></svg>"##;

#[derive(Deserialize)]
pub struct BadgeParams {
    pub builder: Option<String>,
    pub number: Option<u32>,
}

fn badge_for(outcome: BuildOutcome) -> &'static str {
    match outcome {
        BuildOutcome::Succeeded => BADGE_PASSING,
        BuildOutcome::Failed => BADGE_FAILING,
        BuildOutcome::Exception => BADGE_ERROR,
        BuildOutcome::Cancelled => BADGE_CANCELLED,
    }
}

pub async fn badge(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BadgeParams>,
) -> Response {
    let (Some(builder), Some(number)) = (params.builder, params.number) else {
        return (
            StatusCode::BAD_REQUEST,
            "builder and number parameter missing".to_string(),
        )
            .into_response();
    };

    let builder = BuilderName::from(builder.as_str());
    if !state.builders.contains(&builder) {
        return (StatusCode::NOT_FOUND, "unknown builder".to_string()).into_response();
    }

    match state.store.get(&builder, number).await {
        Ok(Some(result)) => (
            [
                (header::CONTENT_TYPE, "image/svg+xml"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            badge_for(result.outcome),
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("unknown build {number}")).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
