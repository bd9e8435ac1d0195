//! Refresh endpoint client
//!
//! `POST /auth/refresh` with `{"refreshToken": ...}` returns a brand-new
//! pair wrapped in `{"data": {...}}`. The call goes through the same
//! `Transport` as ordinary API calls so it shares their timeout policy, but
//! it bypasses the pipeline's middleware: no bearer header, no retry.

use serde::{Deserialize, Serialize};
use transport::{ApiRequest, StatusCode, Transport};

use crate::constants::REFRESH_PATH;
use crate::credentials::CredentialPair;
use crate::error::{Error, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Success body of the refresh endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct RefreshResponse {
    pub data: RefreshedTokens,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Exchange a refresh token for a new credential pair.
///
/// 401/403 mean the refresh token is revoked or expired and map to
/// `InvalidCredentials`; any other non-success status is `RefreshFailed`.
/// Timeouts and connection failures surface as `Transport`. Every error is a
/// refresh failure to the caller.
pub async fn refresh_session(
    transport: &dyn Transport,
    refresh_token: &str,
) -> Result<CredentialPair> {
    let request = ApiRequest::post(REFRESH_PATH).with_json(&RefreshRequest { refresh_token })?;
    let response = transport.send(&request).await?;

    if !response.is_success() {
        let body = response.text();
        if response.status == StatusCode::UNAUTHORIZED || response.status == StatusCode::FORBIDDEN {
            return Err(Error::InvalidCredentials(format!(
                "refresh endpoint returned {}: {body}",
                response.status
            )));
        }
        return Err(Error::RefreshFailed(format!(
            "refresh endpoint returned {}: {body}",
            response.status
        )));
    }

    let parsed: RefreshResponse = response
        .json()
        .map_err(|e| Error::RefreshFailed(format!("invalid refresh response: {e}")))?;

    if parsed.data.access_token.is_empty() || parsed.data.refresh_token.is_empty() {
        return Err(Error::RefreshFailed(
            "refresh response carried an empty token".into(),
        ));
    }

    Ok(CredentialPair::new(
        parsed.data.access_token,
        parsed.data.refresh_token,
    ))
}
