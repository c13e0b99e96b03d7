//! Fan-out of platform events to subscribed WebSocket connections, plus
//! the connection registry and its periodic ping/cleanup sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::connection::{BroadcastEnvelope, ConnectionHandle, OutboundQueue};
use super::subscription::{SubscriptionFilters, SubscriptionManager};

/// Event types escalated to `info`/`warn` logging even when verbose
/// broadcaster logging is off, because operators need to see them land.
const CRITICAL_EVENT_TYPES: &[&str] = &["mcp_auto_disabled", "circuit_breaker_state"];

/// How often the background loop checks for stale connections and sends
/// keepalive pings.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Broadcaster {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    subscriptions: Arc<SubscriptionManager>,
    verbose_logging: bool,
}

impl Broadcaster {
    #[must_use]
    pub fn new(verbose_logging: bool) -> Self {
        Self { connections: RwLock::new(HashMap::new()), subscriptions: Arc::new(SubscriptionManager::new()), verbose_logging }
    }

    #[must_use]
    pub fn subscriptions(&self) -> Arc<SubscriptionManager> {
        self.subscriptions.clone()
    }

    /// Register a newly-accepted connection and send it the current status
    /// snapshot so it isn't blind until the next event fires.
    pub async fn connect(
        &self,
        user_id: impl Into<String>,
        user_role: impl Into<String>,
        queue: OutboundQueue,
        initial_snapshot: &Value,
    ) -> String {
        let user_id = user_id.into();
        let conn_id = format!("{user_id}_{}", Utc::now().timestamp());
        let handle = ConnectionHandle::new(conn_id.clone(), user_id, user_role, queue);

        let envelope =
            BroadcastEnvelope { event_type: "status_snapshot", timestamp: Utc::now().to_rfc3339(), data: initial_snapshot };
        if let Ok(text) = serde_json::to_string(&envelope) {
            handle.send_text(text);
        }

        self.connections.write().await.insert(conn_id.clone(), handle);
        info!(conn_id = %conn_id, "websocket connected");
        conn_id
    }

    pub async fn disconnect(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
        self.subscriptions.remove_all(conn_id);
        debug!(conn_id, "websocket disconnected");
    }

    pub fn subscribe(&self, conn_id: &str, sub_id: impl Into<String>, event_types: Vec<String>, filters: &Value) -> String {
        self.subscriptions.subscribe(conn_id, sub_id, event_types, SubscriptionFilters::from_value(filters))
    }

    pub fn unsubscribe(&self, conn_id: &str, sub_id: &str) -> bool {
        self.subscriptions.unsubscribe(conn_id, sub_id)
    }

    /// Mark activity on `conn_id` in response to a pong or any client
    /// message, resetting its staleness clock.
    pub async fn touch(&self, conn_id: &str) {
        if let Some(handle) = self.connections.write().await.get_mut(conn_id) {
            handle.touch();
        }
    }

    /// Send one envelope to exactly one connection, e.g. a `get_metadata`
    /// reply or a `pong` — unlike [`Self::broadcast_event`] this never
    /// touches the subscription manager.
    pub async fn send_to(&self, conn_id: &str, event_type: &str, data: &Value) {
        let envelope = BroadcastEnvelope { event_type, timestamp: Utc::now().to_rfc3339(), data };
        let Ok(text) = serde_json::to_string(&envelope) else { return };
        if let Some(handle) = self.connections.read().await.get(conn_id) {
            handle.send_text(text);
        }
    }

    /// Close every connection belonging to `user_id`, sending `message`
    /// first so the client can show why. Used when a `user_blocked` event
    /// names `chat` among the blocked services.
    pub async fn close_connections_for_user(&self, user_id: &str, message: &Value, close_code: u16) {
        let mut connections = self.connections.write().await;
        let targets: Vec<String> = connections
            .values()
            .filter(|h| h.user_id == user_id)
            .map(|h| h.conn_id.clone())
            .collect();
        for conn_id in &targets {
            if let Some(handle) = connections.get(conn_id) {
                let envelope =
                    BroadcastEnvelope { event_type: "blocked", timestamp: Utc::now().to_rfc3339(), data: message };
                if let Ok(text) = serde_json::to_string(&envelope) {
                    handle.send_text(text);
                }
                handle.send_close(close_code);
            }
            connections.remove(conn_id);
        }
        drop(connections);
        for conn_id in &targets {
            self.subscriptions.remove_all(conn_id);
        }
    }

    /// Wrap `event_data` in the standard envelope and deliver it to every
    /// connection whose subscriptions match.
    pub async fn broadcast_event(&self, event_type: &str, event_data: &Value) {
        let matching = self.subscriptions.matching_connections(event_type, event_data);
        if matching.is_empty() {
            return;
        }

        if self.verbose_logging || CRITICAL_EVENT_TYPES.contains(&event_type) {
            info!(event_type, matched = matching.len(), "broadcasting event");
        } else {
            debug!(event_type, matched = matching.len(), "broadcasting event");
        }

        let envelope = BroadcastEnvelope { event_type, timestamp: Utc::now().to_rfc3339(), data: event_data };
        let Ok(text) = serde_json::to_string(&envelope) else {
            warn!(event_type, "failed to serialize broadcast envelope");
            return;
        };

        let mut dead = Vec::new();
        let connections = self.connections.read().await;
        for conn_id in &matching {
            if let Some(handle) = connections.get(conn_id) {
                if !handle.send_text(text.clone()) {
                    dead.push(conn_id.clone());
                }
            }
        }
        drop(connections);

        for conn_id in dead {
            self.disconnect(&conn_id).await;
        }
    }

    /// Drop connections that haven't shown activity within the stale
    /// timeout and ping everyone still alive. Intended to run on
    /// [`SWEEP_INTERVAL`].
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut dead = Vec::new();
        {
            let connections = self.connections.read().await;
            for (conn_id, handle) in connections.iter() {
                if handle.is_stale(now) {
                    dead.push(conn_id.clone());
                } else {
                    handle.send_ping();
                }
            }
        }
        for conn_id in dead {
            warn!(conn_id, "dropping stale websocket connection");
            self.disconnect(&conn_id).await;
        }
    }

    /// Run the periodic sweep until `shutdown` resolves.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: tokio::sync::mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.recv() => return,
            }
        }
    }

    #[must_use]
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
