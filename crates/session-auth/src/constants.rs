//! Wire and storage constants shared with the merchant API and front end

/// Refresh endpoint, relative to the API base URL
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Where the consumer is sent to sign in again after an unrecoverable refresh failure
pub const DEFAULT_LOGIN_PATH: &str = "/login";

/// Locations that are already part of the sign-in flow. A failed refresh
/// while the consumer is on one of these does not redirect again.
pub const DEFAULT_AUTH_PATHS: &[&str] = &["/login", "/register", "/forgot-password", "/reset-password"];
