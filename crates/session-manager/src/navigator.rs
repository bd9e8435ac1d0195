//! Sign-in redirection after an unrecoverable refresh failure

use tracing::warn;

use session_auth::{DEFAULT_AUTH_PATHS, DEFAULT_LOGIN_PATH};

/// The consumer's navigation context.
///
/// A browser front end maps these onto its router; the gateway maps them
/// onto response headers.
pub trait Navigator: Send + Sync {
    /// Path the consumer is currently on, if known.
    fn current_location(&self) -> Option<String>;

    /// Send the consumer to `path`.
    fn redirect(&self, path: &str);
}

/// Navigator for headless consumers: logs the redirect and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn current_location(&self) -> Option<String> {
        None
    }

    fn redirect(&self, path: &str) {
        warn!(path, "session ended, sign in required");
    }
}

/// Where sign-in lives and which paths belong to the sign-in flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSurface {
    pub login_path: String,
    pub auth_paths: Vec<String>,
}

impl Default for AuthSurface {
    fn default() -> Self {
        Self {
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            auth_paths: DEFAULT_AUTH_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl AuthSurface {
    /// Whether `location` is part of the sign-in flow.
    ///
    /// Query strings and fragments are ignored. A path matches itself and
    /// anything below it (`/login/sso`), but not siblings (`/login-help`).
    pub fn is_auth_location(&self, location: &str) -> bool {
        let path = location
            .split(['?', '#'])
            .next()
            .unwrap_or(location);
        std::iter::once(self.login_path.as_str())
            .chain(self.auth_paths.iter().map(String::as_str))
            .any(|auth| {
                let auth = auth.trim_end_matches('/');
                path == auth
                    || path
                        .strip_prefix(auth)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }

    /// Redirect unless the consumer is already inside the sign-in flow.
    pub fn should_redirect(&self, current: Option<&str>) -> bool {
        !current.is_some_and(|location| self.is_auth_location(location))
    }
}
