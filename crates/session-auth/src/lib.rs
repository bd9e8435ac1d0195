//! Session credentials for the merchant API
//!
//! Owns everything about the credential pair itself: where it is stored,
//! how the access token's expiry is read, and how the pair is exchanged at
//! the refresh endpoint. Scheduling and single-flight coordination live in
//! `session-manager`.
//!
//! Credential flow:
//! 1. Consumer logs in and hands the pair to the session manager
//! 2. Pair persisted via `CredentialStore::save()`
//! 3. `claims::expires_at()` reads the access token's `exp` for scheduling
//! 4. `token::refresh_session()` exchanges the refresh token for a new pair
//! 5. New pair replaces the old one via `CredentialStore::save()`
//! 6. Logout or a rejected refresh calls `CredentialStore::clear()`

pub mod claims;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use claims::{AccessTokenClaims, decode_claims, expires_at};
pub use constants::*;
pub use credentials::{CredentialPair, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{Error, Result};
pub use token::{RefreshResponse, RefreshedTokens, refresh_session};
