//! The JSON-RPC method table: everything from `initialize` through
//! `tools/call` that a validated, permission-checked caller may invoke.
//!
//! This module knows nothing about HTTP, bearer tokens, or WebSockets — it
//! takes an already-resolved [`PermissionGrant`] and a parsed
//! [`JsonRpcRequest`] and returns the matching [`JsonRpcResponse`] (or
//! `None` for a notification, which gets no response at all).

use gateway_core::{
    demangle_resource_uri, demangle_tool_name, mangle_resource_uri, mangle_tool_name, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, McpError, McpPrompt, McpResource, McpTool,
};
use gateway_orchestrator::{PermissionGrant, Registry, SessionCache, ToolCache};
use serde_json::{json, Value};
use tracing::warn;

/// Fixed protocol version this gateway advertises in its own `initialize`
/// reply, independent of whatever version any particular upstream speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Truncate an upstream error message before it reaches an external
/// caller; upstreams sometimes embed connection strings or stack traces in
/// error text, and that would leak into a response that crossed a trust
/// boundary.
fn safe_error_message(raw: &str) -> String {
    const MAX_LEN: usize = 200;
    if raw.len() <= MAX_LEN {
        raw.to_string()
    } else {
        format!("{}...", &raw[..MAX_LEN])
    }
}

fn error_response(id: Option<Value>, code: i64, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse::failure(id, JsonRpcError::new(code, message))
}

fn success(id: Option<Value>, result: Value) -> JsonRpcResponse {
    JsonRpcResponse::success(id, result)
}

/// Dispatch one already-parsed JSON-RPC request. Returns `None` for
/// notifications, which never get a response.
pub async fn dispatch(
    registry: &Registry,
    session_cache: &SessionCache,
    tool_cache: &ToolCache,
    grant: &PermissionGrant,
    user_id: &str,
    flow_session_id: Option<&str>,
    request: &JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    if request.is_notification() {
        return None;
    }
    let id = request.id.clone();

    let response = match request.method.as_str() {
        "initialize" => success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") },
            }),
        ),
        "ping" => success(id, json!({})),
        "logging/setLevel" => success(id, json!({})),
        "resources/templates/list" => success(id, json!({ "resourceTemplates": [] })),
        "tools/list" => list_tools(registry, session_cache, grant, user_id, flow_session_id, id).await,
        "prompts/list" => list_prompts(registry, session_cache, grant, user_id, flow_session_id, id).await,
        "resources/list" => list_resources(registry, session_cache, grant, user_id, flow_session_id, id).await,
        "tools/call" => call_tool(registry, tool_cache, grant, request, id).await,
        "prompts/get" => get_prompt(registry, grant, request, id).await,
        "resources/read" => read_resource(registry, grant, request, id).await,
        other if other.starts_with("notifications/") => return None,
        _ => error_response(id, JsonRpcError::METHOD_NOT_FOUND, "Method not found"),
    };
    Some(response)
}

/// Upstreams this grant can currently see: the registry's active set
/// intersected with what the grant names. A wildcard `mcp_access` has
/// already been expanded to the full active set by
/// [`gateway_dispatcher::state::build_permission_grant`] before the grant
/// ever reaches here, so this is a plain intersection either way.
async fn visible_upstreams(registry: &Registry, grant: &PermissionGrant) -> Vec<String> {
    registry.active_upstreams().await.into_iter().filter(|u| grant.available_mcps.contains(u)).collect()
}

async fn list_tools(
    registry: &Registry,
    session_cache: &SessionCache,
    grant: &PermissionGrant,
    user_id: &str,
    flow_session_id: Option<&str>,
    id: Option<Value>,
) -> JsonRpcResponse {
    if let Some(cached) = session_cache.get(user_id, flow_session_id) {
        if let Some(tools) = cached.filtered_tools {
            return success(id, json!({ "tools": tools_to_json(&tools) }));
        }
    }

    let upstreams = visible_upstreams(registry, grant).await;
    let mut mangled: Vec<McpTool> = Vec::new();
    for upstream in &upstreams {
        let Some(catalog) = registry.catalog(upstream).await else { continue };
        for tool in grant.filter_tools(upstream, catalog.tools) {
            mangled.push(rename_tool(upstream, tool));
        }
    }

    session_cache.set_tools(user_id, flow_session_id, &upstreams, mangled.clone());
    success(id, json!({ "tools": tools_to_json(&mangled) }))
}

async fn list_prompts(
    registry: &Registry,
    session_cache: &SessionCache,
    grant: &PermissionGrant,
    user_id: &str,
    flow_session_id: Option<&str>,
    id: Option<Value>,
) -> JsonRpcResponse {
    if let Some(cached) = session_cache.get(user_id, flow_session_id) {
        if let Some(prompts) = cached.filtered_prompts {
            return success(id, json!({ "prompts": prompts }));
        }
    }

    let upstreams = visible_upstreams(registry, grant).await;
    let mut mangled: Vec<McpPrompt> = Vec::new();
    for upstream in &upstreams {
        let Some(catalog) = registry.catalog(upstream).await else { continue };
        for prompt in grant.filter_prompts(upstream, catalog.prompts) {
            mangled.push(rename_prompt(upstream, prompt));
        }
    }

    session_cache.set_prompts(user_id, flow_session_id, &upstreams, mangled.clone());
    success(id, json!({ "prompts": mangled }))
}

async fn list_resources(
    registry: &Registry,
    session_cache: &SessionCache,
    grant: &PermissionGrant,
    user_id: &str,
    flow_session_id: Option<&str>,
    id: Option<Value>,
) -> JsonRpcResponse {
    if let Some(cached) = session_cache.get(user_id, flow_session_id) {
        if let Some(resources) = cached.filtered_resources {
            return success(id, json!({ "resources": resources }));
        }
    }

    let upstreams = visible_upstreams(registry, grant).await;
    let mut mangled: Vec<McpResource> = Vec::new();
    for upstream in &upstreams {
        let Some(catalog) = registry.catalog(upstream).await else { continue };
        for resource in grant.filter_resources(upstream, catalog.resources) {
            mangled.push(rename_resource(upstream, resource));
        }
    }

    session_cache.set_resources(user_id, flow_session_id, &upstreams, mangled.clone());
    success(id, json!({ "resources": mangled }))
}

fn tools_to_json(tools: &[McpTool]) -> Value {
    serde_json::to_value(tools).unwrap_or(Value::Array(vec![]))
}

fn rename_tool(upstream: &str, mut tool: McpTool) -> McpTool {
    tool.description = Some(match tool.description {
        Some(d) => format!("[{upstream}] {d}"),
        None => format!("[{upstream}]"),
    });
    tool.name = mangle_tool_name(upstream, &tool.name);
    tool
}

fn rename_prompt(upstream: &str, mut prompt: McpPrompt) -> McpPrompt {
    prompt.description = Some(match prompt.description {
        Some(d) => format!("[{upstream}] {d}"),
        None => format!("[{upstream}]"),
    });
    prompt.name = mangle_tool_name(upstream, &prompt.name);
    prompt
}

fn rename_resource(upstream: &str, mut resource: McpResource) -> McpResource {
    resource.description = Some(match resource.description {
        Some(d) => format!("[{upstream}] {d}"),
        None => format!("[{upstream}]"),
    });
    resource.uri = mangle_resource_uri(upstream, &resource.uri);
    resource
}

fn params_object(request: &JsonRpcRequest) -> Option<&serde_json::Map<String, Value>> {
    request.params.as_ref().and_then(Value::as_object)
}

async fn call_tool(
    registry: &Registry,
    tool_cache: &ToolCache,
    grant: &PermissionGrant,
    request: &JsonRpcRequest,
    id: Option<Value>,
) -> JsonRpcResponse {
    let params = params_object(request);
    let Some(mangled_name) = params.and_then(|p| p.get("name")).and_then(Value::as_str) else {
        return error_response(id, JsonRpcError::INVALID_PARAMS, "Missing 'name' parameter");
    };
    let Some((upstream, tool_name)) = demangle_tool_name(mangled_name) else {
        return error_response(id, JsonRpcError::INVALID_PARAMS, "Malformed tool name");
    };
    let arguments = params.and_then(|p| p.get("arguments")).cloned().unwrap_or_else(|| json!({}));

    if !grant.can_call_tool(upstream, tool_name) {
        return error_response(id, JsonRpcError::INTERNAL_ERROR, "Permission denied");
    }

    if let Some(cached) = tool_cache.get(upstream, tool_name, &arguments) {
        return success(id, json!({ "content": cached.content, "isError": cached.is_error }));
    }

    match registry.call_tool(upstream, tool_name, arguments.clone()).await {
        Ok(result) => {
            tool_cache.set(upstream, tool_name, &arguments, result.clone());
            success(id, json!({ "content": result.content, "isError": result.is_error }))
        }
        Err(McpError::CircuitOpen(_)) => success(
            id,
            json!({
                "status": "unavailable",
                "circuit_state": registry.circuit_state(upstream),
                "retry_after_seconds": registry.retry_after(upstream).unwrap_or(0),
            }),
        ),
        Err(McpError::NoSession(_)) => {
            error_response(id, JsonRpcError::INTERNAL_ERROR, "MCP not available")
        }
        Err(e) => error_response(id, JsonRpcError::SERVER_ERROR, safe_error_message(&e.to_string())),
    }
}

async fn get_prompt(
    registry: &Registry,
    grant: &PermissionGrant,
    request: &JsonRpcRequest,
    id: Option<Value>,
) -> JsonRpcResponse {
    let params = params_object(request);
    let Some(mangled_name) = params.and_then(|p| p.get("name")).and_then(Value::as_str) else {
        return error_response(id, JsonRpcError::INVALID_PARAMS, "Missing 'name' parameter");
    };
    let Some((upstream, prompt_name)) = demangle_tool_name(mangled_name) else {
        return error_response(id, JsonRpcError::INVALID_PARAMS, "Malformed prompt name");
    };
    let arguments = params.and_then(|p| p.get("arguments")).cloned().unwrap_or_else(|| json!({}));

    if !grant.can_get_prompt(upstream, prompt_name) {
        return error_response(id, JsonRpcError::INTERNAL_ERROR, "Permission denied");
    }

    match registry.get_prompt(upstream, prompt_name, arguments).await {
        Ok(result) => success(id, result),
        Err(McpError::NoSession(_) | McpError::CircuitOpen(_)) => {
            error_response(id, JsonRpcError::INTERNAL_ERROR, "MCP not available")
        }
        Err(e) => error_response(id, JsonRpcError::SERVER_ERROR, safe_error_message(&e.to_string())),
    }
}

async fn read_resource(
    registry: &Registry,
    grant: &PermissionGrant,
    request: &JsonRpcRequest,
    id: Option<Value>,
) -> JsonRpcResponse {
    let params = params_object(request);
    let Some(mangled_uri) = params.and_then(|p| p.get("uri")).and_then(Value::as_str) else {
        return error_response(id, JsonRpcError::INVALID_PARAMS, "Missing 'uri' parameter");
    };
    let Some((upstream, uri)) = demangle_resource_uri(mangled_uri) else {
        return error_response(id, JsonRpcError::INVALID_PARAMS, "Malformed resource uri");
    };

    if !grant.can_read_resource(upstream, uri) {
        return error_response(id, JsonRpcError::INTERNAL_ERROR, "Permission denied");
    }

    match registry.read_resource(upstream, uri).await {
        Ok(result) => success(id, result),
        Err(McpError::NoSession(_) | McpError::CircuitOpen(_)) => {
            error_response(id, JsonRpcError::INTERNAL_ERROR, "MCP not available")
        }
        Err(e) => {
            warn!(upstream, uri, error = %e, "resources/read failed");
            error_response(id, JsonRpcError::SERVER_ERROR, safe_error_message(&e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_orchestrator::CircuitBreaker;
    use std::sync::Arc;

    fn registry() -> Registry {
        Registry::with_null_observer(Arc::new(CircuitBreaker::with_defaults()))
    }

    fn grant_for(upstream: &str) -> PermissionGrant {
        PermissionGrant { available_mcps: std::collections::HashSet::from([upstream.to_string()]), restrictions: Default::default() }
    }

    #[tokio::test]
    async fn initialize_returns_fixed_protocol_version() {
        let registry = registry();
        let session_cache = SessionCache::with_default_ttl();
        let tool_cache = ToolCache::with_defaults();
        let grant = PermissionGrant::default();
        let request = JsonRpcRequest::new(1, "initialize", None);
        let response =
            dispatch(&registry, &session_cache, &tool_cache, &grant, "alice", None, &request)
                .await
                .unwrap();
        assert_eq!(response.result.unwrap()["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn notification_gets_no_response() {
        let registry = registry();
        let session_cache = SessionCache::with_default_ttl();
        let tool_cache = ToolCache::with_defaults();
        let grant = PermissionGrant::default();
        let request = JsonRpcRequest::notification("notifications/cancelled", None);
        let response =
            dispatch(&registry, &session_cache, &tool_cache, &grant, "alice", None, &request).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let registry = registry();
        let session_cache = SessionCache::with_default_ttl();
        let tool_cache = ToolCache::with_defaults();
        let grant = PermissionGrant::default();
        let request = JsonRpcRequest::new(1, "totally/unknown", None);
        let response =
            dispatch(&registry, &session_cache, &tool_cache, &grant, "alice", None, &request)
                .await
                .unwrap();
        assert_eq!(response.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_call_without_double_underscore_is_invalid_params() {
        let registry = registry();
        let session_cache = SessionCache::with_default_ttl();
        let tool_cache = ToolCache::with_defaults();
        let grant = PermissionGrant::default();
        let request = JsonRpcRequest::new(1, "tools/call", Some(json!({ "name": "notmangled" })));
        let response =
            dispatch(&registry, &session_cache, &tool_cache, &grant, "alice", None, &request)
                .await
                .unwrap();
        assert_eq!(response.error.unwrap().code, JsonRpcError::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn tools_call_denied_by_permission_grant() {
        let registry = registry();
        let session_cache = SessionCache::with_default_ttl();
        let tool_cache = ToolCache::with_defaults();
        let grant = PermissionGrant::default();
        let request =
            JsonRpcRequest::new(1, "tools/call", Some(json!({ "name": "weather__get_forecast" })));
        let response =
            dispatch(&registry, &session_cache, &tool_cache, &grant, "alice", None, &request)
                .await
                .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, JsonRpcError::INTERNAL_ERROR);
        assert_eq!(error.message, "Permission denied");
    }

    #[tokio::test]
    async fn tools_call_against_open_circuit_returns_typed_unavailable_result() {
        let breaker = Arc::new(CircuitBreaker::with_defaults());
        for _ in 0..5 {
            breaker.record_failure("weather");
        }
        let registry = Registry::with_null_observer(breaker);
        let session_cache = SessionCache::with_default_ttl();
        let tool_cache = ToolCache::with_defaults();
        let grant = grant_for("weather");
        let request =
            JsonRpcRequest::new(1, "tools/call", Some(json!({ "name": "weather__get_forecast" })));
        let response =
            dispatch(&registry, &session_cache, &tool_cache, &grant, "alice", None, &request)
                .await
                .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["status"], "unavailable");
        assert_eq!(result["circuit_state"], "open");
        assert!(result["retry_after_seconds"].as_u64().unwrap() <= 60);
    }

    #[tokio::test]
    async fn safe_error_message_truncates_long_upstream_errors() {
        let long = "x".repeat(500);
        let truncated = safe_error_message(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.ends_with("..."));
    }
}
