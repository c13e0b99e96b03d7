//! Request-path glue: the auth pipeline, the JSON-RPC method table, and
//! the HTTP/WebSocket surfaces that expose them.

pub mod auth;
pub mod dispatch;
pub mod pipeline;
pub mod server;
pub mod state;

pub use auth::{AuthService, HttpAuthService, HttpUserBlockStore, TokenCache, UserBlockStore, UserContext};
pub use dispatch::{dispatch, PROTOCOL_VERSION};
pub use pipeline::{authenticate, PipelineRejection};
pub use server::run;
pub use state::{build_permission_grant, GatewayState, MCP_SERVICE_GRANT};
