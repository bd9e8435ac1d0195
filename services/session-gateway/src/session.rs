//! Session endpoints
//!
//! Endpoints:
//! - POST   /session: store a freshly issued pair and arm the refresh timer
//! - DELETE /session: logout, cancel the timer, clear stored credentials
//!
//! Token values are never echoed back or logged.

use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use session_auth::CredentialPair;
use tracing::{info, warn};

use crate::proxy::GatewayState;

/// Request body for POST /session. Fields are optional so a missing token
/// is reported as 400 with a readable message rather than a serde error.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({ "error": message }).to_string(),
    )
        .into_response()
}

/// POST /session: begin a session with the pair the sign-in flow returned.
pub async fn login(State(state): State<GatewayState>, body: Bytes) -> Response {
    let request: LoginRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {e}"));
        }
    };

    let (access_token, refresh_token) = match (request.access_token, request.refresh_token) {
        (Some(a), Some(r)) if !a.is_empty() && !r.is_empty() => (a, r),
        _ => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "accessToken and refreshToken are required",
            );
        }
    };

    let session = state.pipeline.session();
    if let Err(e) = session
        .login(CredentialPair::new(access_token, refresh_token))
        .await
    {
        warn!(error = %e, "failed to store session");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("failed to store session: {e}"));
    }
    state.navigator.clear_reauth();
    info!("session started via gateway");

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "session": "active",
            "refresh_scheduled_at": session.pending_refresh_at(),
        })
        .to_string(),
    )
        .into_response()
}

/// DELETE /session: logout.
pub async fn logout(State(state): State<GatewayState>) -> Response {
    if let Err(e) = state.pipeline.session().clear().await {
        warn!(error = %e, "failed to clear session");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("failed to clear session: {e}"));
    }
    info!("session ended via gateway");
    StatusCode::NO_CONTENT.into_response()
}
