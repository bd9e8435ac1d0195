//! Static header injection middleware
//!
//! Adds configured headers (client identification, API version pins) to
//! every outgoing call. The `Authorization` header belongs to the session
//! layer and is never overwritten here.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::warn;

use crate::{ApiRequest, Middleware, Result};

/// Header injection rule (name + value pair from config).
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Header pairs are validated once at construction; invalid entries are
/// logged and dropped.
pub struct StaticHeaders {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl StaticHeaders {
    pub fn new(injections: &[HeaderInjection]) -> Self {
        let mut headers = Vec::with_capacity(injections.len());
        for injection in injections {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name == AUTHORIZATION {
                warn!(header = %injection.name, "refusing to inject authorization header");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            headers.push((name, value));
        }
        Self { headers }
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl Middleware for StaticHeaders {
    fn name(&self) -> &str {
        "static-headers"
    }

    fn on_request<'a>(
        &'a self,
        request: &'a mut ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        for (name, value) in &self.headers {
            request.headers.insert(name.clone(), value.clone());
        }
        Box::pin(async { Ok(()) })
    }
}
