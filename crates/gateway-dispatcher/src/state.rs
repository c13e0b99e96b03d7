//! Shared collaborators every request-path task needs: the registry, the
//! caches, and the auth seams. Cloned cheaply (all fields are `Arc`) into
//! every connection task.

use std::collections::HashSet;
use std::sync::Arc;

use gateway_events::Broadcaster;
use gateway_orchestrator::{PermissionGrant, Registry, Restriction, SessionCache, ToolCache};

use crate::auth::{AuthService, TokenCache, UserBlockStore, UserContext};

/// The MCP service grant name every caller must hold to use this gateway
/// at all, checked before any upstream-specific permission logic runs.
pub const MCP_SERVICE_GRANT: &str = "mcp";

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<Registry>,
    pub session_cache: Arc<SessionCache>,
    pub tool_cache: Arc<ToolCache>,
    pub token_cache: Arc<TokenCache>,
    pub auth: Arc<dyn AuthService>,
    pub user_blocks: Arc<dyn UserBlockStore>,
    pub broadcaster: Arc<Broadcaster>,
    /// Roles allowed to open a `/ws` connection; empty means "any
    /// authenticated role".
    pub ws_allowed_roles: Arc<HashSet<String>>,
}

impl GatewayState {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        session_cache: Arc<SessionCache>,
        tool_cache: Arc<ToolCache>,
        token_cache: Arc<TokenCache>,
        auth: Arc<dyn AuthService>,
        user_blocks: Arc<dyn UserBlockStore>,
        broadcaster: Arc<Broadcaster>,
        ws_allowed_roles: HashSet<String>,
    ) -> Self {
        Self {
            registry,
            session_cache,
            tool_cache,
            token_cache,
            auth,
            user_blocks,
            broadcaster,
            ws_allowed_roles: Arc::new(ws_allowed_roles),
        }
    }
}

/// The canonical wildcard form of `mcp_access`: a list containing `"*"`
/// means "every active upstream" (SPEC_FULL.md's resolution of the
/// `"*"`-string-vs-`["*"]`-list ambiguity — callers must normalize to this
/// list form before it reaches here).
const MCP_ACCESS_WILDCARD: &str = "*";

/// Materialize a [`PermissionGrant`] from the auth service's answer,
/// resolved against the upstreams the registry currently has active. A
/// wildcard `mcp_access` expands to every active upstream; otherwise the
/// grant is intersected with the active set — a grant naming an upstream
/// that is down or unloaded simply has nothing to restrict.
#[must_use]
pub fn build_permission_grant(ctx: &UserContext, active_upstreams: &[String]) -> PermissionGrant {
    let available_mcps: HashSet<String> = if ctx.available_mcps.iter().any(|m| m == MCP_ACCESS_WILDCARD) {
        active_upstreams.iter().cloned().collect()
    } else {
        let active: HashSet<&String> = active_upstreams.iter().collect();
        ctx.available_mcps.iter().filter(|m| active.contains(m)).cloned().collect()
    };

    let restrictions = ctx
        .tool_restrictions
        .iter()
        .map(|(upstream, raw)| (upstream.clone(), Restriction::from_value(Some(raw))))
        .collect();

    PermissionGrant { available_mcps, restrictions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn grant_drops_upstreams_that_are_not_currently_active() {
        let ctx = UserContext {
            user_id: "alice".to_string(),
            role: None,
            service_grants: HashSet::new(),
            available_mcps: vec!["weather".to_string(), "stale".to_string()],
            tool_restrictions: HashMap::new(),
        };
        let grant = build_permission_grant(&ctx, &["weather".to_string()]);
        assert!(grant.available_mcps.contains("weather"));
        assert!(!grant.available_mcps.contains("stale"));
    }

    #[test]
    fn wildcard_mcp_access_expands_to_every_active_upstream() {
        let ctx = UserContext {
            user_id: "alice".to_string(),
            role: None,
            service_grants: HashSet::new(),
            available_mcps: vec!["*".to_string()],
            tool_restrictions: HashMap::new(),
        };
        let grant = build_permission_grant(&ctx, &["weather".to_string(), "billing".to_string()]);
        assert!(grant.available_mcps.contains("weather"));
        assert!(grant.available_mcps.contains("billing"));
        assert_eq!(grant.available_mcps.len(), 2);
    }
}
