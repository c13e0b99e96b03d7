//! Forwards breaker and listener health transitions onto the WebSocket
//! broadcaster, so dashboards subscribed to `circuit_breaker_state` and
//! `component_health` see them without the orchestrator or event crates
//! depending on each other.

use std::sync::Arc;

use gateway_events::{Broadcaster, ListenerObserver, ListenerSnapshot};
use gateway_orchestrator::{BreakerObserver, CircuitState, RegistryObserver, UpstreamStatus};
use serde_json::json;

pub struct BroadcastingBreakerObserver {
    broadcaster: Arc<Broadcaster>,
}

impl BroadcastingBreakerObserver {
    #[must_use]
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl BreakerObserver for BroadcastingBreakerObserver {
    fn on_state_change(&self, upstream: &str, old: CircuitState, new: CircuitState) {
        let broadcaster = self.broadcaster.clone();
        let upstream = upstream.to_string();
        tokio::spawn(async move {
            broadcaster
                .broadcast_event(
                    "circuit_breaker_state",
                    &json!({ "mcp_name": upstream, "old_status": format!("{old:?}"), "new_status": format!("{new:?}") }),
                )
                .await;
        });
    }

    fn on_auto_disable(&self, upstream: &str, failure_cycles: u32) {
        let broadcaster = self.broadcaster.clone();
        let upstream = upstream.to_string();
        tokio::spawn(async move {
            broadcaster
                .broadcast_event("mcp_auto_disabled", &json!({ "mcp_name": upstream, "failure_cycles": failure_cycles }))
                .await;
        });
    }
}

pub struct BroadcastingRegistryObserver {
    broadcaster: Arc<Broadcaster>,
}

impl BroadcastingRegistryObserver {
    #[must_use]
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl RegistryObserver for BroadcastingRegistryObserver {
    fn on_status_change(&self, upstream: &str, old: Option<UpstreamStatus>, new: UpstreamStatus) {
        let broadcaster = self.broadcaster.clone();
        let upstream = upstream.to_string();
        tokio::spawn(async move {
            broadcaster
                .broadcast_event(
                    "mcp_status_change",
                    &json!({
                        "mcp_name": upstream,
                        "old_status": old.map(|s| s.as_str()),
                        "new_status": new.as_str(),
                    }),
                )
                .await;
        });
    }
}

pub struct BroadcastingListenerObserver {
    broadcaster: Arc<Broadcaster>,
}

impl BroadcastingListenerObserver {
    #[must_use]
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl ListenerObserver for BroadcastingListenerObserver {
    fn on_health_change(&self, snapshot: &ListenerSnapshot) {
        let broadcaster = self.broadcaster.clone();
        let snapshot = snapshot.clone();
        tokio::spawn(async move {
            broadcaster.broadcast_event("component_health", &serde_json::to_value(&snapshot).unwrap_or(json!({}))).await;
        });
    }
}
