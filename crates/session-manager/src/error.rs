//! Error types for session operations

/// Errors from refresh and session operations.
///
/// `Clone` because one refresh outcome is delivered to every caller queued
/// behind it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no active session")]
    NotAuthenticated,

    #[error("token refresh failed: {0}")]
    Refresh(session_auth::Error),

    #[error("credential store error: {0}")]
    Store(String),

    #[error("session cleared while refresh was in flight")]
    SessionCleared,

    #[error("refresh task ended without reporting an outcome")]
    RefreshAbandoned,
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
