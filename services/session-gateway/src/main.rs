//! Session Gateway
//!
//! Single-binary Rust service that:
//! 1. Holds the merchant session's access/refresh token pair
//! 2. Refreshes it ahead of expiry and on 401, one exchange at a time
//! 3. Forwards the front end's API calls with the bearer token attached
//! 4. Signals the front end to sign in again once the session is lost

mod config;
mod metrics;
mod navigator;
mod proxy;
mod session;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::FileCredentialStore;
use session_manager::{RequestPipeline, SessionManager, SessionOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{ReqwestTransport, StaticHeaders};

use crate::config::Config;
use crate::navigator::GatewayNavigator;
use crate::proxy::GatewayState;

/// How long in-flight requests may take to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    gateway: GatewayState,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

impl FromRef<AppState> for GatewayState {
    fn from_ref(state: &AppState) -> Self {
        state.gateway.clone()
    }
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session", post(session::login).delete(session::logout))
        .fallback(forward_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs; LOG_LEVEL wins over RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.gateway.listen_addr,
        base_url = %config.api.base_url,
        credentials_path = %config.session.credentials_path.display(),
        headers = config.headers.len(),
        "configuration loaded"
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let transport = Arc::new(ReqwestTransport::new(
        client,
        config.api.base_url.clone(),
        Duration::from_secs(config.api.timeout_secs),
    ));

    let store = FileCredentialStore::open(config.session.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open credential store at {}",
                config.session.credentials_path.display()
            )
        })?;

    let navigator = Arc::new(GatewayNavigator::new());
    let session = SessionManager::with_options(
        Arc::new(store),
        transport,
        navigator.clone(),
        SessionOptions {
            policy: config.refresh_policy(),
            surface: config.auth_surface(),
            ..SessionOptions::default()
        },
    );

    if session
        .resume()
        .await
        .context("failed to read stored session")?
    {
        info!(
            refresh_scheduled_at = ?session.pending_refresh_at(),
            "resumed stored session"
        );
    }

    let static_headers = StaticHeaders::new(&config.headers);
    info!(count = static_headers.len(), "static headers configured");
    let pipeline = RequestPipeline::new(session).with_middleware(Arc::new(static_headers));

    let app_state = AppState {
        gateway: GatewayState {
            pipeline: Arc::new(pipeline),
            navigator,
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
        },
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.gateway.max_connections);

    let listener = TcpListener::bind(config.gateway.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.gateway.listen_addr))?;
    info!(addr = %config.gateway.listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: gateway liveness plus the session's state.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let requests = state.gateway.requests_total.load(Ordering::Relaxed);
    let errors = state.gateway.errors_total.load(Ordering::Relaxed);
    let session = state.gateway.pipeline.session();

    let session_state = match session.access_token().await {
        Ok(Some(_)) => "active",
        Ok(None) => "none",
        Err(e) => {
            warn!(error = %e, "failed to read session for health check");
            "unknown"
        }
    };

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "status": "healthy",
            "session": session_state,
            "reauth_required": state.gateway.navigator.reauth_required(),
            "login_path": session.surface().login_path,
            "refresh_scheduled": session.pending_refresh_at().is_some(),
            "uptime_seconds": uptime,
            "requests_served": requests,
            "errors_total": errors,
        })
        .to_string(),
    )
}

/// Prometheus metrics endpoint. Returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Catch-all handler that forwards every other request to the API.
async fn forward_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::forward_request(&state.gateway, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use session_auth::{CredentialPair, CredentialStore, MemoryCredentialStore};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tower::ServiceExt;
    use transport::Transport;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn token_valid_for(secs: u64, tag: &str) -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + secs;
        format!(
            "{}.{}.sig-{tag}",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(format!(r#"{{"jti":"{tag}","exp":{exp}}}"#))
        )
    }

    /// State of the fake merchant API.
    struct FakeApi {
        accepted: Mutex<String>,
        next_access: String,
        refresh_ok: bool,
        refreshes: AtomicUsize,
    }

    /// Start a fake merchant API. Ordinary calls echo the request as JSON
    /// when they carry the accepted bearer token and get 401 otherwise.
    async fn start_fake_api(
        accepted: &str,
        next_access: &str,
        refresh_ok: bool,
    ) -> (String, Arc<FakeApi>) {
        let api = Arc::new(FakeApi {
            accepted: Mutex::new(accepted.to_string()),
            next_access: next_access.to_string(),
            refresh_ok,
            refreshes: AtomicUsize::new(0),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let refresh_api = api.clone();
        let echo_api = api.clone();
        let app = Router::new()
            .route(
                "/auth/refresh",
                post(move || {
                    let api = refresh_api.clone();
                    async move {
                        api.refreshes.fetch_add(1, Ordering::SeqCst);
                        if !api.refresh_ok {
                            return (StatusCode::UNAUTHORIZED, "refresh token expired".to_string());
                        }
                        *api.accepted.lock().unwrap() = api.next_access.clone();
                        (
                            StatusCode::OK,
                            serde_json::json!({
                                "data": {"accessToken": api.next_access, "refreshToken": "rt_next"}
                            })
                            .to_string(),
                        )
                    }
                }),
            )
            .fallback(move |request: Request<Body>| {
                let api = echo_api.clone();
                async move {
                    let expected = format!("Bearer {}", api.accepted.lock().unwrap());
                    let mut headers = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers.insert(
                            name.to_string(),
                            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                        );
                    }
                    let authorized = request
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        == Some(expected.as_str());
                    let path = request.uri().to_string();
                    let method = request.method().to_string();
                    let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                        .await
                        .unwrap();
                    if !authorized {
                        return (
                            StatusCode::UNAUTHORIZED,
                            [("x-api-echo", "true")],
                            r#"{"error":"access token expired"}"#.to_string(),
                        );
                    }
                    (
                        StatusCode::OK,
                        [("x-api-echo", "true")],
                        serde_json::json!({
                            "echoed_headers": headers,
                            "method": method,
                            "path": path,
                            "body": String::from_utf8_lossy(&body),
                        })
                        .to_string(),
                    )
                }
            });

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (url, api)
    }

    fn test_app_state(base_url: &str, store: Arc<MemoryCredentialStore>) -> AppState {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(
            reqwest::Client::new(),
            base_url,
            Duration::from_secs(5),
        ));
        let navigator = Arc::new(GatewayNavigator::new());
        let session = SessionManager::new(store, transport, navigator.clone());
        AppState {
            gateway: GatewayState {
                pipeline: Arc::new(RequestPipeline::new(session)),
                navigator,
                requests_total: Arc::new(AtomicU64::new(0)),
                errors_total: Arc::new(AtomicU64::new(0)),
            },
            started_at: Instant::now(),
            prometheus: test_prometheus_handle(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn health(app: &Router) -> serde_json::Value {
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    fn login_request(body: &str) -> Request<Body> {
        Request::builder()
            .uri("/session")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_no_session() {
        let state = test_app_state("http://unused", Arc::new(MemoryCredentialStore::new()));
        state.gateway.requests_total.fetch_add(5, Ordering::Relaxed);
        let app = build_router(state, 1000);

        let json = health(&app).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["session"], "none");
        assert_eq!(json["reauth_required"], false);
        assert_eq!(json["login_path"], "/login");
        assert_eq!(json["refresh_scheduled"], false);
        assert_eq!(json["requests_served"], 5);
    }

    #[tokio::test]
    async fn login_stores_pair_and_arms_timer() {
        let store = Arc::new(MemoryCredentialStore::new());
        let app = build_router(test_app_state("http://unused", store.clone()), 1000);
        let access = token_valid_for(3600, "login");

        let response = app
            .clone()
            .oneshot(login_request(
                &serde_json::json!({"accessToken": access, "refreshToken": "rt_1"}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["session"], "active");
        assert!(json["refresh_scheduled_at"].is_u64(), "got: {json}");
        assert!(!json.to_string().contains(&access), "token must not be echoed");

        assert_eq!(
            store.load().await.unwrap(),
            Some(CredentialPair::new(access, "rt_1"))
        );
        let json = health(&app).await;
        assert_eq!(json["session"], "active");
        assert_eq!(json["refresh_scheduled"], true);
    }

    #[tokio::test]
    async fn login_without_refresh_token_is_rejected() {
        let store = Arc::new(MemoryCredentialStore::new());
        let app = build_router(test_app_state("http://unused", store.clone()), 1000);

        let response = app
            .clone()
            .oneshot(login_request(r#"{"accessToken":"at_only"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(login_request("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn logout_clears_session() {
        let store = Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
            token_valid_for(3600, "old"),
            "rt_1",
        )));
        let app = build_router(test_app_state("http://unused", store.clone()), 1000);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/session")
                    .method("DELETE")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(store.load().await.unwrap(), None);
        assert_eq!(health(&app).await["session"], "none");
    }

    #[tokio::test]
    async fn forwards_with_session_token_instead_of_client_credentials() {
        let access = token_valid_for(3600, "current");
        let (api_url, api) = start_fake_api(&access, "unused", true).await;
        let store = Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
            access.clone(),
            "rt_1",
        )));
        let app = build_router(test_app_state(&api_url, store), 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/orders?status=open")
                    .method("POST")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer client-supplied")
                    .header("x-app-location", "/orders")
                    .header("x-request-source", "dashboard")
                    .body(Body::from(r#"{"limit":20}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-api-echo").unwrap(), "true");
        let json = body_json(response).await;
        assert_eq!(json["path"], "/v1/orders?status=open");
        assert_eq!(json["method"], "POST");
        assert_eq!(json["body"], r#"{"limit":20}"#);
        assert_eq!(
            json["echoed_headers"]["authorization"],
            format!("Bearer {access}")
        );
        assert_eq!(json["echoed_headers"]["x-request-source"], "dashboard");
        assert!(json["echoed_headers"].get("x-app-location").is_none());
        assert_eq!(api.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_transparently() {
        let fresh = token_valid_for(7200, "fresh");
        let (api_url, api) = start_fake_api("never-matches", &fresh, true).await;
        let store = Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
            token_valid_for(3600, "stale"),
            "rt_1",
        )));
        let app = build_router(test_app_state(&api_url, store.clone()), 1000);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/v1/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(proxy::SESSION_REDIRECT_HEADER).is_none());
        assert_eq!(api.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.load().await.unwrap(),
            Some(CredentialPair::new(fresh, "rt_next"))
        );
        assert_eq!(health(&app).await["refresh_scheduled"], true);
    }

    #[tokio::test]
    async fn failed_refresh_signals_sign_in() {
        let (api_url, api) = start_fake_api("never-matches", "unused", false).await;
        let store = Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
            token_valid_for(3600, "stale"),
            "rt_revoked",
        )));
        let app = build_router(test_app_state(&api_url, store.clone()), 1000);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/orders")
                    .header("x-app-location", "/orders")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(proxy::SESSION_REDIRECT_HEADER).unwrap(),
            "/login"
        );
        assert_eq!(api.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(store.load().await.unwrap(), None);

        let json = health(&app).await;
        assert_eq!(json["session"], "none");
        assert_eq!(json["reauth_required"], true);

        let response = app
            .clone()
            .oneshot(login_request(
                &serde_json::json!({
                    "accessToken": token_valid_for(3600, "again"),
                    "refreshToken": "rt_again"
                })
                .to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(health(&app).await["reauth_required"], false);
    }

    #[tokio::test]
    async fn failed_refresh_on_sign_in_page_does_not_signal() {
        let (api_url, _api) = start_fake_api("never-matches", "unused", false).await;
        let store = Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
            token_valid_for(3600, "stale"),
            "rt_revoked",
        )));
        let app = build_router(test_app_state(&api_url, store), 1000);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/me")
                    .header("x-app-location", "/login?next=/orders")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(proxy::SESSION_REDIRECT_HEADER).is_none());
        assert_eq!(health(&app).await["reauth_required"], false);
    }

    #[tokio::test]
    async fn unreachable_api_returns_gateway_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let state = test_app_state(&format!("http://{addr}"), Arc::new(MemoryCredentialStore::new()));
        let errors = state.gateway.errors_total.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(Request::builder().uri("/v1/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "gateway_error");
        assert!(
            json["error"]["request_id"].as_str().unwrap().starts_with("req_"),
            "got: {json}"
        );
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let state = test_app_state("http://unused", Arc::new(MemoryCredentialStore::new()));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/uploads")
                    .method("POST")
                    .body(Body::from(vec![b'x'; 10 * 1024 * 1024 + 1]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "gateway_error");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let state = test_app_state("http://unused", Arc::new(MemoryCredentialStore::new()));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
