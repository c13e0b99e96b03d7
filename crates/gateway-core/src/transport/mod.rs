//! Wire transports for talking to upstream MCP servers.

mod http_streamable;
mod sse;

pub use http_streamable::HttpStreamableTransport;
pub use sse::SseTransport;

use async_trait::async_trait;

use crate::error::{McpError, Result};
use crate::messages::{JsonRpcRequest, JsonRpcResponse};

/// Session header name captured from `initialize` and echoed on every
/// subsequent request, per the MCP HTTP-streamable convention.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// A transport carries JSON-RPC requests to one upstream and parses its
/// responses. Implementations own the upstream's `mcp-session-id` once
/// captured from the `initialize` response.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its response. `auth_header` is omitted
    /// entirely (not sent empty) when `None`, so callers can probe auth
    /// enforcement by passing `None` on an upstream that requires it.
    async fn send(
        &mut self,
        request: &JsonRpcRequest,
        auth_header: Option<&str>,
    ) -> Result<JsonRpcResponse>;

    /// Send a deliberately raw, possibly-malformed body and return the raw
    /// response bytes without attempting to parse them as JSON-RPC. Used by
    /// security probes exercising upstream input validation.
    async fn send_raw(&mut self, body: Vec<u8>, auth_header: Option<&str>) -> Result<Vec<u8>>;

    /// The session id captured from `initialize`, if any.
    fn session_id(&self) -> Option<&str>;

    fn set_session_id(&mut self, id: Option<String>);

    /// Whether the transport believes the upstream is currently reachable.
    /// Reflects the outcome of the most recent send, not a cached probe.
    fn is_connected(&self) -> bool;
}

/// Parse a response body as either a plain JSON-RPC envelope or a
/// single-line SSE frame (`data: { ... }`), per the MCP wire format.
pub(crate) fn parse_envelope(content_type: Option<&str>, body: &[u8]) -> Result<JsonRpcResponse> {
    let is_event_stream = content_type.is_some_and(|ct| ct.contains("text/event-stream"));
    let text = String::from_utf8_lossy(body);

    let json_text = if is_event_stream || text.trim_start().starts_with("data:") {
        extract_sse_data_line(&text)
            .ok_or_else(|| McpError::Protocol("SSE response contained no data: line".to_string()))?
    } else {
        text.trim().to_string()
    };

    let response: JsonRpcResponse = serde_json::from_str(&json_text)
        .map_err(|e| McpError::Protocol(format!("malformed JSON-RPC response: {e}")))?;
    Ok(response)
}

/// Extract the JSON payload from the first `data: ...` line of an SSE body.
fn extract_sse_data_line(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            let payload = rest.trim();
            if !payload.is_empty() {
                return Some(payload.to_string());
            }
        }
    }
    None
}

/// Turn a JSON-RPC response carrying an error object into an [`McpError`].
pub(crate) fn response_to_result(response: JsonRpcResponse) -> Result<serde_json::Value> {
    if let Some(error) = response.error {
        return Err(McpError::Rpc { code: error.code, message: error.message });
    }
    response
        .result
        .ok_or_else(|| McpError::Protocol("response carried neither result nor error".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_body() {
        let body = br#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;
        let resp = parse_envelope(Some("application/json"), body).unwrap();
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[test]
    fn parses_sse_data_line() {
        let body = b"event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n";
        let resp = parse_envelope(Some("text/event-stream"), body).unwrap();
        assert!(resp.error.is_none());
    }

    #[test]
    fn rejects_sse_body_with_no_data_line() {
        let body = b"event: ping\n\n";
        let err = parse_envelope(Some("text/event-stream"), body).unwrap_err();
        assert!(matches!(err, McpError::Protocol(_)));
    }

    #[test]
    fn response_to_result_surfaces_rpc_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(crate::messages::JsonRpcError::new(-32601, "Method not found")),
            id: None,
        };
        let err = response_to_result(resp).unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32601, .. }));
    }
}
