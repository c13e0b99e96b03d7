//! Wire types, transports, and a single-upstream client for the Model
//! Context Protocol.
//!
//! This crate knows nothing about multiple upstreams, circuit breakers, or
//! permissions — it is the layer that speaks JSON-RPC to one MCP server
//! over one transport. Everything upstream-aggregate lives in
//! `gateway-orchestrator`.

pub mod client;
pub mod error;
pub mod messages;
pub mod naming;
pub mod transport;

pub use client::McpClient;
pub use error::{McpError, Result};
pub use messages::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpContent, McpPrompt, McpPromptArgument,
    McpResource, McpTool, ToolCallResult,
};
pub use naming::{
    demangle_resource_uri, demangle_tool_name, mangle_resource_uri, mangle_tool_name, sanitize,
};
pub use transport::{HttpStreamableTransport, McpTransport, SseTransport};

/// The two transport kinds an upstream can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    HttpStreamable,
    Sse,
}

/// Normalize a configured base URL to the `/mcp` endpoint both transports
/// speak to.
#[must_use]
pub fn normalize_mcp_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/mcp") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/mcp")
    }
}

/// Build a boxed transport for the given kind and (already normalized) URL.
#[must_use]
pub fn build_transport(kind: TransportKind, url: &str) -> Box<dyn McpTransport> {
    match kind {
        TransportKind::HttpStreamable => Box::new(HttpStreamableTransport::new(url)),
        TransportKind::Sse => Box::new(SseTransport::new(url)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_mcp_url_appends_suffix_once() {
        assert_eq!(normalize_mcp_url("https://host.example/"), "https://host.example/mcp");
        assert_eq!(normalize_mcp_url("https://host.example/mcp"), "https://host.example/mcp");
        assert_eq!(normalize_mcp_url("https://host.example/mcp/"), "https://host.example/mcp");
    }
}
