//! Error types for credential storage and refresh operations

use transport::TransportError;

/// Errors from credential operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("refresh token rejected: {0}")]
    InvalidCredentials(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("access token decode failed: {0}")]
    TokenDecode(String),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
