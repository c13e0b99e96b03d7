//! Cross-process invalidation: when a user is blocked anywhere in the
//! platform, every gateway process must drop that user's cached session
//! immediately rather than waiting out the TTL.

use std::sync::Arc;

use gateway_orchestrator::SessionCache;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::redis_listener::{resilient_listener, ListenerObserver, ListenerRegistry};
use crate::websocket::{close_code, Broadcaster};

pub const USER_BLOCKED_CHANNEL: &str = "user_blocked";

#[derive(Debug, Deserialize)]
struct UserBlockedPayload {
    user_id: String,
    #[serde(default)]
    blocked_services: Vec<String>,
    #[serde(default)]
    custom_message: Option<String>,
}

/// Run the `user_blocked` listener. A user named with `"mcp"` among their
/// blocked services has their gateway session cache invalidated; a user
/// named with `"chat"` additionally has every open WebSocket connection
/// closed, after a typed "blocked" message so the client can show why.
pub async fn run_user_blocked_listener(
    client: redis::Client,
    session_cache: Arc<SessionCache>,
    broadcaster: Arc<Broadcaster>,
    registry: Arc<ListenerRegistry>,
    observer: Arc<dyn ListenerObserver>,
    shutdown: watch::Receiver<()>,
) {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        if shutdown.changed().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    resilient_listener(
        client,
        USER_BLOCKED_CHANNEL,
        "session-cache-invalidation",
        registry,
        observer,
        move |payload| {
            let session_cache = session_cache.clone();
            let broadcaster = broadcaster.clone();
            async move {
                match serde_json::from_str::<UserBlockedPayload>(&payload) {
                    Ok(parsed) => {
                        if parsed.blocked_services.iter().any(|s| s == "mcp") {
                            debug!(user_id = %parsed.user_id, "invalidating session cache after block");
                            session_cache.invalidate_user(&parsed.user_id);
                        }
                        if parsed.blocked_services.iter().any(|s| s == "chat") {
                            let message = json!({
                                "user_id": parsed.user_id,
                                "message": parsed.custom_message.unwrap_or_else(|| "access blocked".to_string()),
                            });
                            broadcaster
                                .close_connections_for_user(
                                    &parsed.user_id,
                                    &message,
                                    close_code::POLICY_VIOLATION,
                                )
                                .await;
                        }
                    }
                    Err(e) => warn!(error = %e, "malformed user_blocked payload, ignoring"),
                }
            }
        },
        rx,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalidation_fires_only_when_mcp_is_blocked() {
        let session_cache = Arc::new(SessionCache::with_default_ttl());
        session_cache.set("alice", None, vec!["weather".to_string()], vec![]);
        session_cache.set("bob", None, vec!["weather".to_string()], vec![]);

        let alice_blocked = UserBlockedPayload {
            user_id: "alice".to_string(),
            blocked_services: vec!["mcp".to_string()],
            custom_message: None,
        };
        let bob_blocked = UserBlockedPayload {
            user_id: "bob".to_string(),
            blocked_services: vec!["billing".to_string()],
            custom_message: None,
        };

        if alice_blocked.blocked_services.iter().any(|s| s == "mcp") {
            session_cache.invalidate_user(&alice_blocked.user_id);
        }
        if bob_blocked.blocked_services.iter().any(|s| s == "mcp") {
            session_cache.invalidate_user(&bob_blocked.user_id);
        }

        assert!(session_cache.get("alice", None).is_none());
        assert!(session_cache.get("bob", None).is_some());
    }

    #[tokio::test]
    async fn chat_blocked_closes_connections_after_a_typed_message() {
        let broadcaster = Arc::new(Broadcaster::new(false));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        broadcaster.connect("carol", "member", tx, &json!({})).await;
        rx.recv().await;

        let payload = UserBlockedPayload {
            user_id: "carol".to_string(),
            blocked_services: vec!["chat".to_string()],
            custom_message: Some("you have been removed".to_string()),
        };
        if payload.blocked_services.iter().any(|s| s == "chat") {
            broadcaster
                .close_connections_for_user(
                    &payload.user_id,
                    &json!({ "message": payload.custom_message }),
                    close_code::POLICY_VIOLATION,
                )
                .await;
        }

        let blocked_msg = rx.recv().await.unwrap();
        assert!(matches!(blocked_msg, tokio_tungstenite::tungstenite::Message::Text(_)));
        assert_eq!(broadcaster.connection_count().await, 0);
    }
}
