//! The gateway's HTTP surfaces: single-response JSON-RPC, the
//! newline-delimited streamable variant, and the `/ws` upgrade route, all
//! served off one raw-hyper accept loop per connection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use gateway_core::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use gateway_events::WsIdentity;

use crate::auth::UserContext;
use crate::dispatch::dispatch;
use crate::pipeline::{authenticate, PipelineRejection};
use crate::state::GatewayState;

type BoxBody = Full<Bytes>;

/// Run the accept loop on `addr` until `shutdown` fires, handing each
/// connection to its own task.
pub async fn run(addr: SocketAddr, state: GatewayState, mut shutdown: watch::Receiver<()>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway dispatcher listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state).await {
                                warn!(%peer, error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "error accepting connection"),
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("shutdown signal received, stopping accept loop");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, state: GatewayState) -> std::io::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { route(req, state).await }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
        debug!(error = %e, "connection closed with error");
    }
    Ok(())
}

async fn route(req: Request<Incoming>, state: GatewayState) -> Result<Response<BoxBody>, Infallible> {
    match (req.method().clone(), req.uri().path()) {
        (Method::POST, "/mcp") => Ok(handle_single(req, state).await),
        (Method::POST, "/mcp/stream") => Ok(handle_stream(req, state).await),
        (Method::GET, "/ws") => Ok(handle_ws(req, state).await),
        _ => Ok(respond_text(StatusCode::NOT_FOUND, "not found")),
    }
}

fn respond_text(status: StatusCode, body: &str) -> Response<BoxBody> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

fn respond_json(status: StatusCode, value: &Value) -> Response<BoxBody> {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response.headers_mut().insert(hyper::header::CONTENT_TYPE, "application/json".parse().unwrap());
    response
}

fn header(req: &Request<Incoming>, name: hyper::header::HeaderName) -> Option<&str> {
    req.headers().get(name)?.to_str().ok()
}

fn rejection_response(rejection: PipelineRejection) -> Response<BoxBody> {
    let (status, message) = match rejection {
        PipelineRejection::Unauthorized => (StatusCode::UNAUTHORIZED, "missing or invalid token"),
        PipelineRejection::Forbidden => (StatusCode::FORBIDDEN, "no mcp service grant"),
        PipelineRejection::Blocked => (StatusCode::FORBIDDEN, "user is blocked for mcp"),
    };
    respond_json(status, &json!({ "error": message }))
}

fn parse_error_response(err: &serde_json::Error) -> JsonRpcResponse {
    JsonRpcResponse::failure(
        None,
        JsonRpcError { code: JsonRpcError::PARSE_ERROR, message: "Parse error".to_string(), data: Some(json!({ "error": err.to_string() })) },
    )
}

/// `POST /mcp`: exactly one JSON-RPC request in, at most one response out.
async fn handle_single(req: Request<Incoming>, state: GatewayState) -> Response<BoxBody> {
    let auth_header = header(&req, hyper::header::AUTHORIZATION).map(str::to_string);
    let (context, grant) = match authenticate(&state, auth_header.as_deref()).await {
        Ok(pair) => pair,
        Err(rejection) => return rejection_response(rejection),
    };

    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return respond_json(StatusCode::BAD_REQUEST, &json!({ "error": e.to_string() })),
    };

    let request: JsonRpcRequest = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(e) => return respond_json(StatusCode::OK, &serde_json::to_value(parse_error_response(&e)).unwrap()),
    };

    let response = dispatch_one(&state, &context, &grant, &request).await;
    match response {
        Some(r) => respond_json(StatusCode::OK, &serde_json::to_value(r).unwrap()),
        None => respond_json(StatusCode::OK, &json!({})),
    }
}

/// `POST /mcp/stream`: body is either one request or a JSON array of
/// requests; response body is one JSON frame per logical response,
/// newline-delimited. Notifications emit no frame.
async fn handle_stream(req: Request<Incoming>, state: GatewayState) -> Response<BoxBody> {
    let auth_header = header(&req, hyper::header::AUTHORIZATION).map(str::to_string);
    let (context, grant) = match authenticate(&state, auth_header.as_deref()).await {
        Ok(pair) => pair,
        Err(rejection) => return rejection_response(rejection),
    };

    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return respond_json(StatusCode::BAD_REQUEST, &json!({ "error": e.to_string() })),
    };

    let raw: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            let frame = serde_json::to_string(&parse_error_response(&e)).unwrap_or_default();
            return ndjson_response(vec![frame]);
        }
    };

    let requests: Vec<JsonRpcRequest> = match raw {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<JsonRpcRequest>(item) {
                Ok(r) => Some(r),
                Err(_) => None,
            })
            .collect(),
        single => match serde_json::from_value::<JsonRpcRequest>(single) {
            Ok(r) => vec![r],
            Err(e) => {
                let frame = serde_json::to_string(&parse_error_response(&e)).unwrap_or_default();
                return ndjson_response(vec![frame]);
            }
        },
    };

    let mut frames = Vec::with_capacity(requests.len());
    for request in &requests {
        if let Some(response) = dispatch_one(&state, &context, &grant, request).await {
            if let Ok(text) = serde_json::to_string(&response) {
                frames.push(text);
            }
        }
    }
    ndjson_response(frames)
}

fn ndjson_response(frames: Vec<String>) -> Response<BoxBody> {
    let mut body = frames.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response.headers_mut().insert(hyper::header::CONTENT_TYPE, "application/json".parse().unwrap());
    response
}

async fn dispatch_one(
    state: &GatewayState,
    context: &UserContext,
    grant: &gateway_orchestrator::PermissionGrant,
    request: &JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    dispatch(&state.registry, &state.session_cache, &state.tool_cache, grant, &context.user_id, None, request).await
}

/// `GET /ws`: same auth pipeline, then handed to the broadcaster's upgrade
/// handler with the resolved identity and a status snapshot of every
/// active upstream.
async fn handle_ws(req: Request<Incoming>, state: GatewayState) -> Response<BoxBody> {
    let auth_header = header(&req, hyper::header::AUTHORIZATION).map(str::to_string);
    let identity = match authenticate(&state, auth_header.as_deref()).await {
        Ok((context, _grant)) => {
            if !state.ws_allowed_roles.is_empty()
                && !context.role.as_deref().map(|r| state.ws_allowed_roles.contains(r)).unwrap_or(false)
            {
                None
            } else {
                Some(WsIdentity { user_id: context.user_id, user_role: context.role.unwrap_or_default() })
            }
        }
        Err(_) => None,
    };

    let snapshot = initial_status_snapshot(&state).await;
    match gateway_events::handle_upgrade(req, identity, state.broadcaster.clone(), snapshot).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "websocket upgrade error");
            respond_text(StatusCode::INTERNAL_SERVER_ERROR, "upgrade failed")
        }
    }
}

async fn initial_status_snapshot(state: &GatewayState) -> Value {
    let upstreams = state.registry.active_upstreams().await;
    let mut mcps = Vec::with_capacity(upstreams.len());
    for name in &upstreams {
        let health_status = state.registry.status(name).await;
        let circuit_state = state.registry.circuit_state(name);
        mcps.push(json!({
            "name": name,
            "health_status": health_status.map(|s| format!("{s:?}").to_lowercase()),
            "circuit_state": circuit_state,
        }));
    }
    json!({ "type": "initial_status", "mcps": mcps })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ndjson_response_joins_frames_with_trailing_newline() {
        let response = ndjson_response(vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"{\"a\":1}\n{\"b\":2}\n");
    }

    #[tokio::test]
    async fn ndjson_response_with_no_frames_is_an_empty_body() {
        let response = ndjson_response(vec![]);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[test]
    fn rejection_response_maps_unauthorized_to_401() {
        let response = rejection_response(PipelineRejection::Unauthorized);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn rejection_response_maps_forbidden_to_403() {
        let response = rejection_response(PipelineRejection::Forbidden);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = rejection_response(PipelineRejection::Blocked);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
