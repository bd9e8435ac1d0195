//! Forwarding through the request pipeline
//!
//! Receives the front end's API calls, strips hop-by-hop and client
//! credential headers, and sends them through the `RequestPipeline` so the
//! session's bearer token, shared refresh and single retry apply. Returns
//! the API response verbatim, plus a sign-in hint on 401 once the session
//! has ended.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use session_manager::RequestPipeline;
use tracing::{debug, error, instrument};
use transport::{ApiRequest, TransportError};

use crate::metrics;
use crate::navigator::GatewayNavigator;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Front end's current location, fed to the navigator
pub const APP_LOCATION_HEADER: &str = "x-app-location";

/// Set on 401 responses once the session has ended
pub const SESSION_REDIRECT_HEADER: &str = "x-session-redirect";

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the forwarding handler via axum State extractor
#[derive(Clone)]
pub struct GatewayState {
    pub pipeline: Arc<RequestPipeline>,
    pub navigator: Arc<GatewayNavigator>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error body: {"error":{"type":"gateway_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "gateway_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Forward one front-end call to the API.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn forward_request(
    state: &GatewayState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let method = request.method().clone();
    let url = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if let Some(location) = request
        .headers()
        .get(APP_LOCATION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        state.navigator.set_location(location);
    }

    let mut headers = HeaderMap::new();
    for (name, value) in request.headers() {
        if forwardable(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            metrics::record_request(
                StatusCode::BAD_REQUEST.as_u16(),
                method.as_str(),
                started.elapsed().as_secs_f64(),
            );
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let mut api_request = ApiRequest::new(method.clone(), url).with_body(body);
    api_request.headers = headers;

    let response = match state.pipeline.send(api_request).await {
        Ok(api_response) => {
            let status = api_response.status;
            let mut response = Response::builder().status(status);
            for (name, value) in &api_response.headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            if status == StatusCode::UNAUTHORIZED && state.navigator.reauth_required() {
                let login_path = &state.pipeline.session().surface().login_path;
                debug!(login_path = %login_path, "session ended, signalling sign-in");
                response = response.header(SESSION_REDIRECT_HEADER, login_path.as_str());
            }
            response
                .body(Body::from(api_response.body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("response build error: {e}"),
                        &request_id,
                    )
                })
        }
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error(e.kind());
            error!(error = %e, "API request failed");
            let status = match e {
                TransportError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            error_response(status, &format!("upstream error: {e}"), &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether a client request header is passed on to the API. The session
/// owns `Authorization`; `Host` belongs to the API's base URL.
fn forwardable(name: &str) -> bool {
    !is_hop_by_hop(name)
        && !name.eq_ignore_ascii_case(AUTHORIZATION.as_str())
        && !name.eq_ignore_ascii_case(HOST.as_str())
        && !name.eq_ignore_ascii_case(APP_LOCATION_HEADER)
}
