//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The credentials file location can be overridden with
//! SESSION_CREDENTIALS_PATH so deployments can keep tokens outside the
//! directory holding the TOML.

use serde::Deserialize;
use session_manager::{AuthSurface, RefreshPolicy};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transport::HeaderInjection;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// Local listener settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Merchant API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    /// Applies to every call, the refresh exchange included
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Credential storage and sign-in routing
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_auth_paths")]
    pub auth_paths: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            login_path: default_login_path(),
            auth_paths: default_auth_paths(),
        }
    }
}

/// Proactive refresh thresholds, in seconds
#[derive(Debug, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_min_lead")]
    pub min_lead_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_buffer")]
    pub max_buffer_secs: u64,
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            min_lead_secs: default_min_lead(),
            cooldown_secs: default_cooldown(),
            max_buffer_secs: default_max_buffer(),
            min_delay_secs: default_min_delay(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_login_path() -> String {
    session_auth::DEFAULT_LOGIN_PATH.to_string()
}

fn default_auth_paths() -> Vec<String> {
    session_auth::DEFAULT_AUTH_PATHS
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_min_lead() -> u64 {
    30
}

fn default_cooldown() -> u64 {
    30
}

fn default_max_buffer() -> u64 {
    300
}

fn default_min_delay() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.api.base_url.starts_with("http://")
            && !config.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.api.base_url
            )));
        }

        if config.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if !config.session.login_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "login_path must start with '/', got: {}",
                config.session.login_path
            )));
        }

        if let Ok(path) = std::env::var("SESSION_CREDENTIALS_PATH") {
            config.session.credentials_path = PathBuf::from(path);
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-gateway.toml")
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            min_lead: Duration::from_secs(self.refresh.min_lead_secs),
            cooldown: Duration::from_secs(self.refresh.cooldown_secs),
            max_buffer: Duration::from_secs(self.refresh.max_buffer_secs),
            min_delay: Duration::from_secs(self.refresh.min_delay_secs),
        }
    }

    pub fn auth_surface(&self) -> AuthSurface {
        AuthSurface {
            login_path: self.session.login_path.clone(),
            auth_paths: self.session.auth_paths.clone(),
        }
    }
}
