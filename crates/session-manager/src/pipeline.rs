//! Authenticated request pipeline
//!
//! Every outgoing API call passes through `RequestPipeline::send`: the
//! middleware chain (bearer credential first), the transport, then the
//! response side of the chain. An authorization failure on a call that has
//! not been retried triggers one shared refresh and one retry.

use std::sync::Arc;

use tracing::{debug, warn};
use transport::header::AUTHORIZATION;
use transport::{ApiRequest, ApiResponse, Middleware, Transport};

use crate::bearer::BearerAuth;
use crate::coordinator::SessionManager;
use crate::metrics;

pub struct RequestPipeline {
    session: SessionManager,
    transport: Arc<dyn Transport>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl RequestPipeline {
    /// Pipeline over the session's transport with bearer credentials attached.
    pub fn new(session: SessionManager) -> Self {
        let transport = Arc::clone(session.transport());
        let bearer: Arc<dyn Middleware> = Arc::new(BearerAuth::new(Arc::clone(session.store())));
        Self {
            session,
            transport,
            middleware: vec![bearer],
        }
    }

    /// Append a stage after the ones already registered.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Send `request`, refreshing and retrying once on 401.
    ///
    /// When the stored token already differs from the one the request
    /// carried, another caller's refresh has landed and the retry goes out
    /// without a new exchange. When the refresh fails the original 401
    /// response is returned; the session has already been cleared by then.
    /// A 401 on the retry is returned as is. Transport failures are errors.
    pub async fn send(&self, mut request: ApiRequest) -> transport::Result<ApiResponse> {
        let response = self.attempt(&mut request).await?;
        if !response.is_authorization_failure() || request.already_retried {
            return Ok(response);
        }

        request.already_retried = true;
        metrics::record_retry();

        if self.token_rotated_since(&request).await {
            debug!(method = %request.method, url = %request.url, "token already refreshed, retrying");
            return self.attempt(&mut request).await;
        }

        debug!(method = %request.method, url = %request.url, "authorization failed, refreshing");
        match self.session.refresh().await {
            Ok(_) => self.attempt(&mut request).await,
            Err(e) => {
                warn!(
                    method = %request.method,
                    url = %request.url,
                    error = %e,
                    "refresh failed, returning original authorization failure"
                );
                Ok(response)
            }
        }
    }

    /// Whether the store holds a different access token than the one
    /// `request` was sent with.
    async fn token_rotated_since(&self, request: &ApiRequest) -> bool {
        let Some(sent) = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return false;
        };
        match self.session.access_token().await {
            Ok(Some(current)) => current != sent,
            _ => false,
        }
    }

    async fn attempt(&self, request: &mut ApiRequest) -> transport::Result<ApiResponse> {
        for stage in &self.middleware {
            stage.on_request(request).await?;
        }
        let mut response = self.transport.send(request).await?;
        for stage in &self.middleware {
            stage.on_response(request, &mut response).await?;
        }
        Ok(response)
    }
}
