//! Access token expiry
//!
//! The access token is `header.payload.signature`, each part base64url. The
//! payload is a JSON object whose `exp` claim is the expiry in Unix seconds.
//! The signature is not verified; the API does that. We only need to know
//! when to refresh.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::debug;

use crate::error::{Error, Result};

/// Claims read from an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessTokenClaims {
    /// Expiry as a unix timestamp in milliseconds
    pub expires_at: u64,
}

/// Decode the payload of an access token.
pub fn decode_claims(token: &str) -> Result<AccessTokenClaims> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => {
            return Err(Error::TokenDecode(
                "expected three dot-separated parts".into(),
            ));
        }
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::TokenDecode(format!("payload is not base64url: {e}")))?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::TokenDecode(format!("payload is not JSON: {e}")))?;

    let exp = claims
        .get("exp")
        .ok_or_else(|| Error::TokenDecode("missing exp claim".into()))?;

    let expires_at = if let Some(secs) = exp.as_u64() {
        secs.saturating_mul(1000)
    } else {
        match exp.as_f64() {
            Some(secs) if secs.is_finite() && secs >= 0.0 => (secs * 1000.0) as u64,
            _ => return Err(Error::TokenDecode(format!("exp is not a timestamp: {exp}"))),
        }
    };

    Ok(AccessTokenClaims { expires_at })
}

/// Expiry of an access token in unix milliseconds, or `None` when it
/// cannot be decoded. `None` means "do not schedule", never "abort".
pub fn expires_at(token: &str) -> Option<u64> {
    match decode_claims(token) {
        Ok(claims) => Some(claims.expires_at),
        Err(e) => {
            debug!(error = %e, "access token expiry unknown");
            None
        }
    }
}
