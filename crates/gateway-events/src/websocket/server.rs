//! HTTP upgrade handling for the `/ws` endpoint, built on `hyper-tungstenite`
//! to stay on the same raw-hyper server as the rest of the gateway rather
//! than pulling in a web framework just for this one route.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, warn};

use super::broadcaster::Broadcaster;
use super::connection::OutboundQueue;
use super::event_registry::event_metadata;

/// Identity established by whatever auth layer sits in front of the
/// upgrade request (a bearer token check, in this gateway's case).
pub struct WsIdentity {
    pub user_id: String,
    pub user_role: String,
}

/// Close codes used when rejecting or tearing down a connection, per the
/// WebSocket close-code convention this gateway follows.
pub mod close_code {
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const RESTARTING: u16 = 1012;
}

/// Handle one `/ws` request: if it's not an upgrade, reject it; if the
/// caller has no identity, reject with 1008 after completing the upgrade
/// handshake (matching the convention of always speaking WebSocket once
/// the handshake headers match, then closing with a policy code).
pub async fn handle_upgrade(
    mut request: Request<Incoming>,
    identity: Option<WsIdentity>,
    broadcaster: Arc<Broadcaster>,
    initial_snapshot: Value,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if !hyper_tungstenite::is_upgrade_request(&request) {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::new(Bytes::from_static(b"expected a websocket upgrade")))
            .unwrap());
    }

    let (response, websocket) = match hyper_tungstenite::upgrade(&mut request, None) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "websocket upgrade failed");
            return Ok(Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from_static(b"upgrade failed")))
                .unwrap());
        }
    };

    tokio::spawn(async move {
        let ws = match websocket.await {
            Ok(ws) => ws,
            Err(e) => {
                error!(error = %e, "websocket handshake did not complete");
                return;
            }
        };

        let Some(identity) = identity else {
            let (mut write, _) = ws.split();
            let _ = write
                .send(Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                    code: close_code::POLICY_VIOLATION.into(),
                    reason: "authentication required".into(),
                })))
                .await;
            return;
        };

        serve_connection(ws, identity, broadcaster, initial_snapshot).await;
    });

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Full::new(body.into())))
}

async fn serve_connection(
    ws: tokio_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>,
    identity: WsIdentity,
    broadcaster: Arc<Broadcaster>,
    initial_snapshot: Value,
) {
    let (mut write, mut read) = ws.split();
    let queue = OutboundQueue::new();

    let conn_id =
        broadcaster.connect(identity.user_id, identity.user_role, queue.clone(), &initial_snapshot).await;

    let writer_queue = queue.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = writer_queue.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(_) => break,
        };
        broadcaster.touch(&conn_id).await;

        match frame {
            Message::Text(text) => handle_client_message(&broadcaster, &conn_id, &text).await,
            Message::Pong(_) => {}
            Message::Close(_) => break,
            _ => {}
        }
    }

    queue.close();
    let _ = writer_task.await;
    broadcaster.disconnect(&conn_id).await;
}

async fn handle_client_message(broadcaster: &Arc<Broadcaster>, conn_id: &str, text: &str) {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        if text == "ping" {
            broadcaster.touch(conn_id).await;
        }
        return;
    };

    match message.get("action").and_then(Value::as_str) {
        Some("subscribe") => {
            let event_types: Vec<String> = message
                .get("event_types")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let filters = message.get("filters").cloned().unwrap_or(Value::Object(Default::default()));
            let sub_id = format!("sub_{}", uuid::Uuid::new_v4().simple());
            broadcaster.subscribe(conn_id, sub_id, event_types, &filters);
        }
        Some("unsubscribe") => {
            if let Some(sub_id) = message.get("subscription_id").and_then(Value::as_str) {
                broadcaster.unsubscribe(conn_id, sub_id);
            }
        }
        Some("get_metadata") => {
            broadcaster.send_to(conn_id, "metadata", &event_metadata()).await;
        }
        Some("ping") => {
            broadcaster.send_to(conn_id, "pong", &Value::String("pong".to_string())).await;
        }
        _ => warn!(conn_id, "unrecognized websocket action"),
    }
}
