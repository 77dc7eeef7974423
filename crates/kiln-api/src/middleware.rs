//! HTTP middleware and request authorization.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::state::AppState;

/// Create CORS middleware layer.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .allow_origin(Any)
}

/// Inject request ID into each request.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(value) = request_id.parse() {
        request.headers_mut().insert("x-request-id", value);
    }

    let mut response = next.run(request).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Check Basic credentials against the configured operator accounts.
/// Returns the account's username, for attribution on forced and cancelled
/// builds.
pub fn authorize_operator(
    state: &AppState,
    auth: Option<&TypedHeader<Authorization<Basic>>>,
) -> Result<String, (StatusCode, String)> {
    let Some(TypedHeader(auth)) = auth else {
        return Err((
            StatusCode::UNAUTHORIZED,
            "Authentication required".to_string(),
        ));
    };
    let allowed = state
        .config
        .accounts
        .iter()
        .any(|account| account.username == auth.username() && account.password == auth.password());
    if !allowed {
        return Err((StatusCode::UNAUTHORIZED, "Invalid credentials".to_string()));
    }
    Ok(auth.username().to_string())
}
