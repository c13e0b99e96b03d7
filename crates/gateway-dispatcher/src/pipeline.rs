//! The inbound request pipeline shared by every JSON-RPC surface: token
//! extraction, validation, grant/block checks. HTTP-status mapping lives
//! in `server.rs`; this module only decides allow/deny.

use gateway_orchestrator::PermissionGrant;

use crate::auth::{extract_bearer, UserContext};
use crate::state::{build_permission_grant, GatewayState, MCP_SERVICE_GRANT};

/// Why a request was rejected before it ever reached the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRejection {
    /// No or malformed bearer token, or the auth service rejected it.
    Unauthorized,
    /// Token is valid but the caller has no `mcp` service grant.
    Forbidden,
    /// Token is valid and grants `mcp`, but the user is blocked for it.
    Blocked,
}

/// Run steps 1-4 of the inbound pipeline and return the resolved identity
/// and permission grant, or the rejection reason.
pub async fn authenticate(
    state: &GatewayState,
    authorization_header: Option<&str>,
) -> Result<(UserContext, PermissionGrant), PipelineRejection> {
    let token = extract_bearer(authorization_header).ok_or(PipelineRejection::Unauthorized)?;

    let context = match state.token_cache.get(token) {
        Some(ctx) => ctx,
        None => {
            let ctx = state.auth.validate(token).await.map_err(|_| PipelineRejection::Unauthorized)?;
            state.token_cache.set(token, ctx.clone());
            ctx
        }
    };

    if !context.service_grants.contains(MCP_SERVICE_GRANT) {
        return Err(PipelineRejection::Forbidden);
    }

    if state.user_blocks.is_blocked(&context.user_id, MCP_SERVICE_GRANT).await {
        return Err(PipelineRejection::Blocked);
    }

    let active = state.registry.active_upstreams().await;
    let grant = build_permission_grant(&context, &active);
    Ok((context, grant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthService, TokenCache, UserBlockStore};
    use async_trait::async_trait;
    use gateway_core::McpError;
    use gateway_events::Broadcaster;
    use gateway_orchestrator::{CircuitBreaker, Registry, SessionCache, ToolCache};
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    struct FixedAuth(Option<UserContext>);

    #[async_trait]
    impl AuthService for FixedAuth {
        async fn validate(&self, _token: &str) -> Result<UserContext, McpError> {
            self.0.clone().ok_or_else(|| McpError::Authentication("invalid".to_string()))
        }
    }

    struct NeverBlocked;

    #[async_trait]
    impl UserBlockStore for NeverBlocked {
        async fn is_blocked(&self, _user_id: &str, _service: &str) -> bool {
            false
        }
    }

    struct AlwaysBlocked;

    #[async_trait]
    impl UserBlockStore for AlwaysBlocked {
        async fn is_blocked(&self, _user_id: &str, _service: &str) -> bool {
            true
        }
    }

    fn state(auth: Arc<dyn AuthService>, blocks: Arc<dyn UserBlockStore>) -> GatewayState {
        GatewayState::new(
            Arc::new(Registry::with_null_observer(Arc::new(CircuitBreaker::with_defaults()))),
            Arc::new(SessionCache::with_default_ttl()),
            Arc::new(ToolCache::with_defaults()),
            Arc::new(TokenCache::with_default_ttl()),
            auth,
            blocks,
            Arc::new(Broadcaster::new(false)),
            Default::default(),
        )
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let s = state(Arc::new(FixedAuth(None)), Arc::new(NeverBlocked));
        let err = authenticate(&s, None).await.unwrap_err();
        assert_eq!(err, PipelineRejection::Unauthorized);
    }

    #[tokio::test]
    async fn token_without_mcp_grant_is_forbidden() {
        let ctx = UserContext {
            user_id: "alice".to_string(),
            role: None,
            service_grants: HashSet::from(["chat".to_string()]),
            available_mcps: vec!["billing".to_string()],
            tool_restrictions: HashMap::new(),
        };
        let s = state(Arc::new(FixedAuth(Some(ctx))), Arc::new(NeverBlocked));
        let err = authenticate(&s, Some("Bearer tok")).await.unwrap_err();
        assert_eq!(err, PipelineRejection::Forbidden);
    }

    #[tokio::test]
    async fn blocked_user_is_rejected_even_with_grant() {
        let ctx = UserContext {
            user_id: "alice".to_string(),
            role: None,
            service_grants: HashSet::from(["mcp".to_string()]),
            available_mcps: vec!["weather".to_string()],
            tool_restrictions: HashMap::new(),
        };
        let s = state(Arc::new(FixedAuth(Some(ctx))), Arc::new(AlwaysBlocked));
        let err = authenticate(&s, Some("Bearer tok")).await.unwrap_err();
        assert_eq!(err, PipelineRejection::Blocked);
    }

    #[tokio::test]
    async fn valid_grant_passes_through() {
        let ctx = UserContext {
            user_id: "alice".to_string(),
            role: None,
            service_grants: HashSet::from(["mcp".to_string()]),
            available_mcps: vec!["weather".to_string()],
            tool_restrictions: HashMap::new(),
        };
        let s = state(Arc::new(FixedAuth(Some(ctx))), Arc::new(NeverBlocked));
        let (resolved, _grant) = authenticate(&s, Some("Bearer tok")).await.unwrap();
        assert_eq!(resolved.user_id, "alice");
    }
}
