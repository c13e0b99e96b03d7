//! Bearer token validation and the external user-block check.
//!
//! Both seams are traits because the real auth service and user-block store
//! live outside this workspace; the dispatcher only needs to call out and
//! get a yes/no or a resolved identity back.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gateway_core::McpError;
use serde::Deserialize;
use serde_json::Value;

/// How long a validated token's [`UserContext`] is trusted before the auth
/// service is consulted again — short enough that a revoked grant doesn't
/// stay effective for long, per the dispatcher's miss-then-cache pipeline.
pub const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

/// What the external auth service knows about a validated token.
#[derive(Debug, Clone, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
    /// The service tags this user's grant carries (e.g. `"mcp"`, `"chat"`)
    /// — orthogonal to `available_mcps`, which names *which upstreams*
    /// within the `mcp` service the user may see, not *whether* they hold
    /// the `mcp` service grant at all.
    #[serde(default)]
    pub service_grants: HashSet<String>,
    #[serde(default)]
    pub available_mcps: Vec<String>,
    /// Per-upstream restriction, still in whatever shape the access store
    /// handed back (string, array, or object) — decoded later by
    /// [`gateway_orchestrator::permission::Restriction::from_value`].
    #[serde(default)]
    pub tool_restrictions: HashMap<String, Value>,
}

/// Seam for the external auth/identity service.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate(&self, token: &str) -> Result<UserContext, McpError>;
}

/// Seam for the external user-block store, consulted after a token has
/// already validated so a blocked-but-not-yet-revoked token is still
/// rejected.
#[async_trait]
pub trait UserBlockStore: Send + Sync {
    async fn is_blocked(&self, user_id: &str, service: &str) -> bool;
}

/// A `reqwest`-backed auth service calling a configured validation
/// endpoint with the caller's bearer token forwarded as-is.
pub struct HttpAuthService {
    client: reqwest::Client,
    validate_url: String,
}

impl HttpAuthService {
    #[must_use]
    pub fn new(client: reqwest::Client, validate_url: impl Into<String>) -> Self {
        Self { client, validate_url: validate_url.into() }
    }
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn validate(&self, token: &str) -> Result<UserContext, McpError> {
        let response = self
            .client
            .get(&self.validate_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| McpError::Authentication(e.to_string()))?;
        if !response.status().is_success() {
            return Err(McpError::Authentication(format!(
                "auth service rejected token: HTTP {}",
                response.status()
            )));
        }
        response.json::<UserContext>().await.map_err(|e| McpError::Authentication(e.to_string()))
    }
}

/// A `reqwest`-backed user-block store calling a configured lookup
/// endpoint. Any transport failure is treated as "not blocked" rather than
/// failing every request open a user-block-store outage; that tradeoff
/// favors availability, matching the breaker's own fail-open posture for
/// non-availability errors.
pub struct HttpUserBlockStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUserBlockStore {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl UserBlockStore for HttpUserBlockStore {
    async fn is_blocked(&self, user_id: &str, service: &str) -> bool {
        let url = format!("{}/users/{user_id}/blocked/{service}", self.base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success() && response.status() != reqwest::StatusCode::NO_CONTENT,
            Err(e) => {
                tracing::warn!(error = %e, "user-block store unreachable, treating as not blocked");
                false
            }
        }
    }
}

struct CachedContext {
    context: UserContext,
    expires_at: Instant,
}

/// Short-lived cache of validated tokens, so a busy caller doesn't round
/// trip to the external auth service on every single request.
pub struct TokenCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedContext>>,
}

impl TokenCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()) }
    }

    #[must_use]
    pub fn with_default_ttl() -> Self {
        Self::new(TOKEN_CACHE_TTL)
    }

    #[must_use]
    pub fn get(&self, token: &str) -> Option<UserContext> {
        let entries = self.entries.read().expect("token cache lock poisoned");
        let entry = entries.get(token)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.context.clone())
    }

    pub fn set(&self, token: impl Into<String>, context: UserContext) {
        let mut entries = self.entries.write().expect("token cache lock poisoned");
        entries.insert(token.into(), CachedContext { context, expires_at: Instant::now() + self.ttl });
    }

    pub fn invalidate(&self, token: &str) {
        self.entries.write().expect("token cache lock poisoned").remove(token);
    }
}

/// Extract the bearer token from an `Authorization` header value.
#[must_use]
pub fn extract_bearer(header_value: Option<&str>) -> Option<&str> {
    header_value?.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_token_from_well_formed_header() {
        assert_eq!(extract_bearer(Some("Bearer abc123")), Some("abc123"));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        assert_eq!(extract_bearer(None), None);
        assert_eq!(extract_bearer(Some("Basic abc123")), None);
        assert_eq!(extract_bearer(Some("Bearer ")), None);
    }

    fn context(user_id: &str) -> UserContext {
        UserContext {
            user_id: user_id.to_string(),
            role: None,
            service_grants: HashSet::new(),
            available_mcps: vec![],
            tool_restrictions: HashMap::new(),
        }
    }

    #[test]
    fn token_cache_set_then_get_round_trips() {
        let cache = TokenCache::with_default_ttl();
        cache.set("tok-1", context("alice"));
        assert_eq!(cache.get("tok-1").unwrap().user_id, "alice");
    }

    #[test]
    fn token_cache_expires_entries() {
        let cache = TokenCache::new(Duration::from_millis(10));
        cache.set("tok-1", context("alice"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("tok-1").is_none());
    }

    #[test]
    fn token_cache_invalidate_drops_immediately() {
        let cache = TokenCache::with_default_ttl();
        cache.set("tok-1", context("alice"));
        cache.invalidate("tok-1");
        assert!(cache.get("tok-1").is_none());
    }
}
