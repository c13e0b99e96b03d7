//! Resilient pub/sub listener with exponential backoff reconnection.
//!
//! A single upstream failure must never kill the listener task: handler
//! errors are logged and swallowed, and connection errors retry with
//! backoff that resets as soon as a connection succeeds again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerStatus {
    Connected,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ListenerSnapshot {
    pub component: String,
    pub channel: String,
    pub status: ListenerStatus,
    pub reconnect_count: u32,
    pub retry_in_seconds: Option<u64>,
    pub error: Option<String>,
}

/// Process-wide registry of listener health, mirroring what an operator's
/// status endpoint or dashboard would want to show.
#[derive(Default)]
pub struct ListenerRegistry {
    statuses: RwLock<HashMap<String, ListenerSnapshot>>,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn set(&self, name: &str, snapshot: ListenerSnapshot) {
        self.statuses.write().await.insert(name.to_string(), snapshot);
    }

    pub async fn all(&self) -> Vec<ListenerSnapshot> {
        self.statuses.read().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<ListenerSnapshot> {
        self.statuses.read().await.get(name).cloned()
    }
}

/// Observes listener health transitions, e.g. to forward `component_health`
/// events onto the WebSocket broadcaster.
pub trait ListenerObserver: Send + Sync {
    fn on_health_change(&self, snapshot: &ListenerSnapshot);
}

pub struct NullListenerObserver;

impl ListenerObserver for NullListenerObserver {
    fn on_health_change(&self, _snapshot: &ListenerSnapshot) {}
}

/// Subscribe to `channel` on `client`, handing every message to `handler`,
/// reconnecting with exponential backoff on any connection failure, until
/// `shutdown` is signalled. Handler errors are logged, not propagated —
/// one bad message must not take the listener down.
pub async fn resilient_listener<F, Fut>(
    client: redis::Client,
    channel: impl Into<String>,
    name: impl Into<String>,
    registry: Arc<ListenerRegistry>,
    observer: Arc<dyn ListenerObserver>,
    mut handler: F,
    mut shutdown: watch::Receiver<bool>,
) where
    F: FnMut(String) -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let channel = channel.into();
    let name = name.into();
    let mut backoff = INITIAL_BACKOFF;
    let mut reconnect_count = 0u32;

    loop {
        if *shutdown.borrow() {
            publish_status(&registry, &observer, &name, &channel, ListenerStatus::Stopped, reconnect_count, None, None)
                .await;
            return;
        }

        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(e) = pubsub.subscribe(&channel).await {
                    warn!(listener = %name, channel = %channel, error = %e, "subscribe failed");
                    reconnect_count += 1;
                    publish_status(
                        &registry,
                        &observer,
                        &name,
                        &channel,
                        ListenerStatus::Reconnecting,
                        reconnect_count,
                        Some(backoff.as_secs()),
                        Some(e.to_string()),
                    )
                    .await;
                    if wait_or_shutdown(&mut backoff, &mut shutdown).await {
                        return;
                    }
                    continue;
                }

                info!(listener = %name, channel = %channel, "connected");
                backoff = INITIAL_BACKOFF;
                publish_status(&registry, &observer, &name, &channel, ListenerStatus::Connected, reconnect_count, None, None)
                    .await;

                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        msg = stream.next() => {
                            match msg {
                                Some(msg) => {
                                    let payload: String = match msg.get_payload() {
                                        Ok(p) => p,
                                        Err(e) => {
                                            warn!(listener = %name, error = %e, "undecodable payload, skipping");
                                            continue;
                                        }
                                    };
                                    handler(payload).await;
                                }
                                None => {
                                    warn!(listener = %name, "pubsub stream ended, reconnecting");
                                    break;
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                drop(stream);
                                publish_status(&registry, &observer, &name, &channel, ListenerStatus::Stopped, reconnect_count, None, None).await;
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(listener = %name, error = %e, "connection failed");
                reconnect_count += 1;
                publish_status(
                    &registry,
                    &observer,
                    &name,
                    &channel,
                    ListenerStatus::Reconnecting,
                    reconnect_count,
                    Some(backoff.as_secs()),
                    Some(e.to_string()),
                )
                .await;
                if wait_or_shutdown(&mut backoff, &mut shutdown).await {
                    return;
                }
            }
        }
    }
}

async fn wait_or_shutdown(backoff: &mut Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(*backoff) => {
            *backoff = (*backoff * 2).min(MAX_BACKOFF);
            false
        }
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn publish_status(
    registry: &Arc<ListenerRegistry>,
    observer: &Arc<dyn ListenerObserver>,
    name: &str,
    channel: &str,
    status: ListenerStatus,
    reconnect_count: u32,
    retry_in_seconds: Option<u64>,
    error: Option<String>,
) {
    let snapshot = ListenerSnapshot {
        component: name.to_string(),
        channel: channel.to_string(),
        status,
        reconnect_count,
        retry_in_seconds,
        error,
    };
    registry.set(name, snapshot.clone()).await;
    observer.on_health_change(&snapshot);
}

/// Publish a message onto `channel`. Used by the invalidation bus to fan a
/// local event out to every other gateway process.
pub async fn publish(client: &redis::Client, channel: &str, payload: &str) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.publish(channel, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_before_any_connection_attempt_marks_stopped_immediately() {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        let registry = Arc::new(ListenerRegistry::new());
        let observer = Arc::new(NullListenerObserver);
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();

        resilient_listener(client, "events", "test-listener", registry.clone(), observer, |_| async {}, rx)
            .await;

        let snapshot = registry.get("test-listener").await.unwrap();
        assert_eq!(snapshot.status, ListenerStatus::Stopped);
    }

    #[test]
    fn listener_snapshot_serializes_status_as_snake_case() {
        let snapshot = ListenerSnapshot {
            component: "test".to_string(),
            channel: "events".to_string(),
            status: ListenerStatus::Reconnecting,
            reconnect_count: 2,
            retry_in_seconds: Some(4),
            error: None,
        };
        let v = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(v["status"], "reconnecting");
    }
}
