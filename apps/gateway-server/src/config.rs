//! Startup configuration, read once from the environment per the
//! gateway's "read at startup, restart to change" policy — upstream
//! definitions and per-role policies are the one thing read continuously,
//! by the coordinator's desired-state source, not by this module.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Everything the gateway binary needs before it can start accepting
/// connections.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the dispatcher's HTTP/WebSocket surface binds to.
    pub bind_address: SocketAddr,
    /// Redis connection string for the invalidation bus and flow streams.
    pub redis_url: String,
    /// Base URL of the external auth service's token-validation endpoint.
    pub auth_validate_url: String,
    /// Base URL of the external user-block store.
    pub user_block_base_url: String,
    /// Base URL of the external store the coordinator polls for upstream
    /// definitions and per-role policies.
    pub admin_store_url: String,
    /// How long a validated token is trusted before re-checking the auth
    /// service.
    pub token_cache_ttl: Duration,
    /// Roles allowed to open a `/ws` connection; empty means any role.
    pub ws_allowed_roles: Vec<String>,
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn env_var_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a present one
    /// fails to parse.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address_raw = env_var_or("GATEWAY_BIND_ADDRESS", "0.0.0.0:8080");
        let bind_address = bind_address_raw.parse().map_err(|_| ConfigError::Invalid {
            name: "GATEWAY_BIND_ADDRESS",
            value: bind_address_raw.clone(),
        })?;

        let token_cache_ttl_secs: u64 = env_var_or("GATEWAY_TOKEN_CACHE_TTL_SECS", "60")
            .parse()
            .map_err(|_| ConfigError::Invalid { name: "GATEWAY_TOKEN_CACHE_TTL_SECS", value: "not a u64".to_string() })?;

        let ws_allowed_roles = env_var_or("GATEWAY_WS_ALLOWED_ROLES", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            bind_address,
            redis_url: env_var("GATEWAY_REDIS_URL")?,
            auth_validate_url: env_var("GATEWAY_AUTH_VALIDATE_URL")?,
            user_block_base_url: env_var("GATEWAY_USER_BLOCK_BASE_URL")?,
            admin_store_url: env_var("GATEWAY_ADMIN_STORE_URL")?,
            token_cache_ttl: Duration::from_secs(token_cache_ttl_secs),
            ws_allowed_roles,
        })
    }
}
