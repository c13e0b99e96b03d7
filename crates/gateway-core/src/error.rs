//! Error types for MCP upstream operations.

use thiserror::Error;

/// Result type for MCP operations.
pub type Result<T> = std::result::Result<T, McpError>;

/// Errors that can occur while talking to an upstream MCP server.
///
/// Connection failures at `initialize` time are kept distinct from
/// transport failures on an already-established session, and both are
/// distinct from a JSON-RPC error object returned by the upstream itself —
/// callers (the circuit breaker, the dispatcher) need to tell these apart.
#[derive(Debug, Error)]
pub enum McpError {
    /// Failed to establish the initial session (the `initialize` handshake).
    #[error("failed to connect to upstream: {0}")]
    Connect(String),

    /// A transport-level failure on an already-initialized session
    /// (network error, timeout, closed connection).
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream returned a response that does not parse as a valid
    /// JSON-RPC 2.0 envelope, or omitted a required field.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The upstream returned a well-formed JSON-RPC error object.
    #[error("upstream returned error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code, e.g. -32601.
        code: i64,
        /// Human-readable error message.
        message: String,
    },

    /// No session is currently open for the named upstream.
    #[error("no session for upstream: {0}")]
    NoSession(String),

    /// The upstream's circuit breaker is currently open; distinct from
    /// [`McpError::NoSession`] so callers can surface the typed
    /// "unavailable" result instead of a generic internal error.
    #[error("circuit open for upstream: {0}")]
    CircuitOpen(String),

    /// The requested tool is not present in the upstream's catalog.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Authentication failed or was rejected by the upstream.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Invalid configuration (bad URL, unsupported transport, bad auth kind).
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// True when this error should be treated as a breaker-countable
    /// availability failure rather than a protocol nuance.
    ///
    /// Per the error handling design: `-32601`/`-32602` responses from the
    /// upstream are protocol-correct and must not count against it; only
    /// connection/transport failures and `-32603`/`-32000` do.
    #[must_use]
    pub fn counts_against_breaker(&self) -> bool {
        match self {
            McpError::Connect(_) | McpError::Transport(_) | McpError::Protocol(_) => true,
            McpError::Rpc { code, .. } => *code == -32603 || *code == -32000,
            McpError::NoSession(_)
            | McpError::CircuitOpen(_)
            | McpError::ToolNotFound(_)
            | McpError::Authentication(_)
            | McpError::Config(_)
            | McpError::Json(_) => false,
        }
    }

    /// True when the upstream's answer was simply "method not found" for an
    /// optional capability (`prompts/list`, `resources/list`) — treated as
    /// "this upstream has none", not as an error.
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, McpError::Rpc { code, .. } if *code == -32601)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_transport_count_against_breaker() {
        assert!(McpError::Connect("x".into()).counts_against_breaker());
        assert!(McpError::Transport("x".into()).counts_against_breaker());
        assert!(McpError::Protocol("x".into()).counts_against_breaker());
    }

    #[test]
    fn method_not_found_and_invalid_params_do_not_count() {
        let not_found = McpError::Rpc { code: -32601, message: "nope".into() };
        let bad_params = McpError::Rpc { code: -32602, message: "bad".into() };
        assert!(!not_found.counts_against_breaker());
        assert!(!bad_params.counts_against_breaker());
        assert!(not_found.is_method_not_found());
    }

    #[test]
    fn internal_and_tool_errors_count_against_breaker() {
        let internal = McpError::Rpc { code: -32603, message: "boom".into() };
        let tool_error = McpError::Rpc { code: -32000, message: "boom".into() };
        assert!(internal.counts_against_breaker());
        assert!(tool_error.counts_against_breaker());
    }

    #[test]
    fn permission_and_auth_never_count() {
        assert!(!McpError::Authentication("bad token".into()).counts_against_breaker());
        assert!(!McpError::Config("bad restriction json".into()).counts_against_breaker());
    }
}
