//! A connected session against one upstream MCP server.

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::json;

use crate::error::{McpError, Result};
use crate::messages::{JsonRpcRequest, McpPrompt, McpResource, McpTool, ToolCallResult};
use crate::transport::{response_to_result, McpTransport};

/// The MCP protocol version this client speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// An initialized session against a single upstream, over whatever
/// transport it was configured with.
pub struct McpClient {
    name: String,
    transport: Box<dyn McpTransport>,
    next_id: AtomicI64,
    auth_header: Option<String>,
}

impl McpClient {
    /// Perform the `initialize` handshake and return a ready client.
    ///
    /// `auth_header` is threaded through every request, including
    /// `initialize` itself, unless the caller passes `None` to probe an
    /// upstream that is expected to require authentication.
    pub async fn connect(
        name: impl Into<String>,
        mut transport: Box<dyn McpTransport>,
        auth_header: Option<String>,
    ) -> Result<Self> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") },
        });
        let request = JsonRpcRequest::new(1, "initialize", Some(params));
        let response = transport
            .send(&request, auth_header.as_deref())
            .await
            .map_err(|e| McpError::Connect(e.to_string()))?;
        response_to_result(response).map_err(|e| McpError::Connect(e.to_string()))?;

        let initialized = JsonRpcRequest::notification("notifications/initialized", Some(json!({})));
        transport
            .send(&initialized, auth_header.as_deref())
            .await
            .map_err(|e| McpError::Connect(e.to_string()))?;

        Ok(Self { name: name.into(), transport, next_id: AtomicI64::new(2), auth_header })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.transport.session_id()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn call(&mut self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);
        let response = self
            .transport
            .send(&request, self.auth_header.as_deref())
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        response_to_result(response)
    }

    /// `tools/list`.
    pub async fn list_tools(&mut self) -> Result<Vec<McpTool>> {
        let result = self.call("tools/list", None).await?;
        let tools = result.get("tools").cloned().unwrap_or(serde_json::Value::Array(vec![]));
        Ok(serde_json::from_value(tools)?)
    }

    /// `prompts/list`. Callers should treat `is_method_not_found` on the
    /// returned error as "this upstream has no prompts", not a failure.
    pub async fn list_prompts(&mut self) -> Result<Vec<McpPrompt>> {
        let result = self.call("prompts/list", None).await?;
        let prompts = result.get("prompts").cloned().unwrap_or(serde_json::Value::Array(vec![]));
        Ok(serde_json::from_value(prompts)?)
    }

    /// `resources/list`. Same method-not-found tolerance as `list_prompts`.
    pub async fn list_resources(&mut self) -> Result<Vec<McpResource>> {
        let result = self.call("resources/list", None).await?;
        let resources = result.get("resources").cloned().unwrap_or(serde_json::Value::Array(vec![]));
        Ok(serde_json::from_value(resources)?)
    }

    /// `tools/call` with the upstream's own (unmangled) tool name.
    pub async fn call_tool(
        &mut self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult> {
        let params = json!({ "name": tool_name, "arguments": arguments });
        let result = self.call("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `prompts/get`.
    pub async fn get_prompt(
        &mut self,
        prompt_name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut params = json!({ "name": prompt_name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        self.call("prompts/get", Some(params)).await
    }

    /// `resources/read`, given the upstream's own (unprefixed) URI.
    pub async fn read_resource(&mut self, uri: &str) -> Result<serde_json::Value> {
        self.call("resources/read", Some(json!({ "uri": uri }))).await
    }

    /// `ping`, used by health checks.
    pub async fn ping(&mut self) -> Result<()> {
        self.call("ping", None).await?;
        Ok(())
    }

    /// Send a raw, possibly-malformed payload straight through the
    /// transport, bypassing request construction entirely.
    pub async fn send_raw(&mut self, body: Vec<u8>) -> Result<Vec<u8>> {
        self.transport.send_raw(body, self.auth_header.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::messages::{JsonRpcError, JsonRpcResponse};

    struct MockTransport {
        connected: bool,
        session_id: Option<String>,
        next_result: serde_json::Value,
        saw_auth: bool,
    }

    #[async_trait]
    impl McpTransport for MockTransport {
        async fn send(
            &mut self,
            request: &JsonRpcRequest,
            auth_header: Option<&str>,
        ) -> Result<crate::messages::JsonRpcResponse> {
            self.saw_auth = auth_header.is_some();
            self.connected = true;
            if request.is_notification() {
                return Ok(JsonRpcResponse::success(None, serde_json::Value::Null));
            }
            Ok(JsonRpcResponse::success(request.id.clone(), self.next_result.clone()))
        }

        async fn send_raw(&mut self, _body: Vec<u8>, _auth_header: Option<&str>) -> Result<Vec<u8>> {
            Ok(b"{}".to_vec())
        }

        fn session_id(&self) -> Option<&str> {
            self.session_id.as_deref()
        }

        fn set_session_id(&mut self, id: Option<String>) {
            self.session_id = id;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[tokio::test]
    async fn connect_sends_auth_header_when_present() {
        let transport = MockTransport {
            connected: false,
            session_id: Some("sess-1".to_string()),
            next_result: json!({ "serverInfo": { "name": "demo" } }),
            saw_auth: false,
        };
        let client =
            McpClient::connect("demo", Box::new(transport), Some("Bearer abc".to_string())).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn list_tools_parses_result_array() {
        let transport = MockTransport {
            connected: false,
            session_id: None,
            next_result: json!({ "tools": [{ "name": "echo" }] }),
            saw_auth: false,
        };
        let mut client = McpClient::connect("demo", Box::new(transport), None).await.unwrap();
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    struct FailingTransport;

    #[async_trait]
    impl McpTransport for FailingTransport {
        async fn send(
            &mut self,
            request: &JsonRpcRequest,
            _auth_header: Option<&str>,
        ) -> Result<crate::messages::JsonRpcResponse> {
            Ok(JsonRpcResponse::failure(
                request.id.clone(),
                JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, "boom"),
            ))
        }

        async fn send_raw(&mut self, _body: Vec<u8>, _auth_header: Option<&str>) -> Result<Vec<u8>> {
            Ok(vec![])
        }

        fn session_id(&self) -> Option<&str> {
            None
        }

        fn set_session_id(&mut self, _id: Option<String>) {}

        fn is_connected(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn connect_surfaces_initialize_failure_as_connect_error() {
        let err = McpClient::connect("demo", Box::new(FailingTransport), None).await.unwrap_err();
        assert!(matches!(err, McpError::Connect(_)));
    }
}
