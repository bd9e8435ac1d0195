//! Transport abstraction for outgoing API calls
//!
//! Defines the request/response values that flow through the session
//! pipeline, the `Transport` trait that actually puts them on the wire, and
//! the `Middleware` trait for ordered request/response transforms. Nothing
//! here knows about credentials; the session manager plugs its bearer-token
//! middleware and retry logic on top.

pub mod client;
pub mod headers;
pub mod message;

pub use client::ReqwestTransport;
pub use headers::{HeaderInjection, StaticHeaders};
pub use message::{ApiRequest, ApiResponse};
pub use reqwest::{Method, StatusCode, header};

use std::future::Future;
use std::pin::Pin;

/// Errors raised while sending a request or reading its response.
///
/// Payloads are strings so the error stays `Clone`; the session manager
/// broadcasts one refresh failure to every queued caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl TransportError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connection",
            TransportError::Http(_) => "http",
            TransportError::InvalidRequest(_) => "invalid_request",
            TransportError::Decode(_) => "decode",
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Sends a single request and returns the full response.
///
/// Implementations apply their own timeout policy; every caller (ordinary
/// API calls and the token refresh call alike) shares it.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "reqwest")
    fn id(&self) -> &str;

    /// Send the request. Non-2xx statuses are returned as `Ok`; only I/O,
    /// timeout and encoding problems are errors.
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>>;
}

/// One stage in the pipeline's ordered transform chain.
///
/// `on_request` runs before every attempt (including a retry, so a stage
/// that attaches credentials picks up a freshly refreshed token).
/// `on_response` runs after every attempt, in the same order.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn on_request<'a>(
        &'a self,
        request: &'a mut ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn on_response<'a>(
        &'a self,
        _request: &'a ApiRequest,
        _response: &'a mut ApiResponse,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}
