//! The `http-streamable` transport: a plain POST to `<base>/mcp` whose
//! response is either a JSON body or a single SSE `data:` frame.

use async_trait::async_trait;
use reqwest::Client;

use super::{parse_envelope, McpTransport, SESSION_ID_HEADER};
use crate::error::{McpError, Result};
use crate::messages::{JsonRpcRequest, JsonRpcResponse};

/// HTTP-streamable transport for one upstream MCP server.
pub struct HttpStreamableTransport {
    url: String,
    client: Client,
    session_id: Option<String>,
    connected: bool,
}

impl HttpStreamableTransport {
    /// `url` should already be normalized to end in `/mcp`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), client: Client::new(), session_id: None, connected: false }
    }

    fn build_request(
        &self,
        auth_header: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .header("Content-Type", "application/json");

        if let Some(session_id) = &self.session_id {
            req = req.header(SESSION_ID_HEADER, session_id);
        }
        if let Some(auth) = auth_header {
            req = req.header("Authorization", auth);
        }
        req
    }

    fn capture_session_id(&mut self, headers: &reqwest::header::HeaderMap) {
        if self.session_id.is_none() {
            if let Some(value) = headers.get(SESSION_ID_HEADER) {
                if let Ok(s) = value.to_str() {
                    self.session_id = Some(s.to_string());
                }
            }
        }
    }
}

#[async_trait]
impl McpTransport for HttpStreamableTransport {
    async fn send(
        &mut self,
        request: &JsonRpcRequest,
        auth_header: Option<&str>,
    ) -> Result<JsonRpcResponse> {
        let response = self
            .build_request(auth_header)
            .json(request)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            self.connected = false;
            return Err(McpError::Transport(format!(
                "upstream returned status {}",
                response.status()
            )));
        }

        let content_type =
            response.headers().get("content-type").and_then(|v| v.to_str().ok()).map(String::from);
        self.capture_session_id(response.headers());

        let body = response.bytes().await.map_err(|e| McpError::Transport(e.to_string()))?;

        if request.is_notification() {
            self.connected = true;
            return Ok(JsonRpcResponse::success(None, serde_json::Value::Null));
        }

        let parsed = parse_envelope(content_type.as_deref(), &body);
        self.connected = parsed.is_ok();
        parsed
    }

    async fn send_raw(&mut self, body: Vec<u8>, auth_header: Option<&str>) -> Result<Vec<u8>> {
        let response = self
            .build_request(auth_header)
            .body(body)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        self.capture_session_id(response.headers());
        self.connected = response.status().is_success();
        response.bytes().await.map(|b| b.to_vec()).map_err(|e| McpError::Transport(e.to_string()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transport_starts_disconnected_with_no_session() {
        let t = HttpStreamableTransport::new("https://example.com/mcp");
        assert!(!t.is_connected());
        assert!(t.session_id().is_none());
    }

    #[test]
    fn set_session_id_is_idempotent_with_capture() {
        let mut t = HttpStreamableTransport::new("https://example.com/mcp");
        t.set_session_id(Some("abc-123".to_string()));
        assert_eq!(t.session_id(), Some("abc-123"));
    }
}
