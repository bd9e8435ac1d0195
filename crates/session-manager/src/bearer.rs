//! Bearer credential middleware

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use session_auth::CredentialStore;
use transport::header::{AUTHORIZATION, HeaderValue};
use transport::{ApiRequest, Middleware, TransportError};

/// Attaches `Authorization: Bearer <access token>` from the credential store.
///
/// Reads the store on every attempt, so a retry after a refresh carries the
/// new token. Without a stored session the request goes out untouched.
pub struct BearerAuth {
    store: Arc<dyn CredentialStore>,
}

impl BearerAuth {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }
}

impl Middleware for BearerAuth {
    fn name(&self) -> &str {
        "bearer-auth"
    }

    fn on_request<'a>(
        &'a self,
        request: &'a mut ApiRequest,
    ) -> Pin<Box<dyn Future<Output = transport::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let pair = self
                .store
                .load()
                .await
                .map_err(|e| TransportError::InvalidRequest(format!("reading credentials: {e}")))?;
            let Some(pair) = pair else {
                return Ok(());
            };

            let mut value = HeaderValue::from_str(&format!("Bearer {}", pair.access_token.expose()))
                .map_err(|_| {
                    TransportError::InvalidRequest("access token is not a valid header value".into())
                })?;
            value.set_sensitive(true);
            request.headers.insert(AUTHORIZATION, value);
            Ok(())
        })
    }
}
