//! Subscription bookkeeping and event-to-connection matching.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilters {
    pub mcp_names: Option<HashSet<String>>,
    pub severity: Option<HashSet<String>>,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub state: Option<HashSet<String>>,
    pub health_status: Option<HashSet<String>>,
    pub failure_cycles_min: Option<i64>,
}

impl SubscriptionFilters {
    #[must_use]
    pub fn from_value(raw: &Value) -> Self {
        let as_set = |key: &str| -> Option<HashSet<String>> {
            raw.get(key)?.as_array().map(|arr| {
                arr.iter().filter_map(|v| v.as_str().map(String::from)).collect::<HashSet<_>>()
            })
        };
        let as_string = |key: &str| -> Option<String> { raw.get(key)?.as_str().map(String::from) };

        Self {
            mcp_names: as_set("mcp_names").filter(|s| !s.is_empty()),
            severity: as_set("severity").filter(|s| !s.is_empty()),
            old_status: as_string("old_status"),
            new_status: as_string("new_status"),
            state: as_set("state").filter(|s| !s.is_empty()),
            health_status: as_set("health_status").filter(|s| !s.is_empty()),
            failure_cycles_min: raw.get("failure_cycles").and_then(Value::as_i64),
        }
    }

    fn matches(&self, event_data: &Value) -> bool {
        if let Some(names) = &self.mcp_names {
            if let Some(mcp_name) = event_data.get("mcp_name").and_then(Value::as_str) {
                if !names.contains(mcp_name) {
                    return false;
                }
            }
        }
        if let Some(severities) = &self.severity {
            if let Some(severity) = event_data.get("severity").and_then(Value::as_str) {
                if !severities.contains(severity) {
                    return false;
                }
            }
        }
        if let Some(expected) = &self.old_status {
            if event_data.get("old_status").and_then(Value::as_str) != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.new_status {
            if event_data.get("new_status").and_then(Value::as_str) != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(states) = &self.state {
            if let Some(state) = event_data.get("state").and_then(Value::as_str) {
                if !states.contains(state) {
                    return false;
                }
            }
        }
        if let Some(statuses) = &self.health_status {
            if let Some(health_status) = event_data.get("health_status").and_then(Value::as_str) {
                if !statuses.contains(health_status) {
                    return false;
                }
            }
        }
        if let Some(min) = self.failure_cycles_min {
            let failure_cycles = event_data.get("failure_cycles").and_then(Value::as_i64).unwrap_or(0);
            if failure_cycles < min {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub event_types: Vec<String>,
    pub filters: SubscriptionFilters,
}

/// Tracks every connection's subscriptions and resolves which connections
/// should receive a given event.
#[derive(Default)]
pub struct SubscriptionManager {
    by_connection: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        conn_id: &str,
        sub_id: impl Into<String>,
        event_types: Vec<String>,
        filters: SubscriptionFilters,
    ) -> String {
        let sub_id = sub_id.into();
        let subscription = Subscription { id: sub_id.clone(), event_types, filters };
        self.by_connection.write().expect("subscription lock poisoned").entry(conn_id.to_string()).or_default().push(
            subscription,
        );
        sub_id
    }

    pub fn unsubscribe(&self, conn_id: &str, sub_id: &str) -> bool {
        let mut by_connection = self.by_connection.write().expect("subscription lock poisoned");
        let Some(subs) = by_connection.get_mut(conn_id) else { return false };
        let before = subs.len();
        subs.retain(|s| s.id != sub_id);
        subs.len() != before
    }

    pub fn remove_all(&self, conn_id: &str) {
        self.by_connection.write().expect("subscription lock poisoned").remove(conn_id);
    }

    /// Connection ids whose subscriptions match `event_type`/`event_data`.
    #[must_use]
    pub fn matching_connections(&self, event_type: &str, event_data: &Value) -> HashSet<String> {
        let by_connection = self.by_connection.read().expect("subscription lock poisoned");
        let mut matched = HashSet::new();
        for (conn_id, subs) in by_connection.iter() {
            let matches = subs.iter().any(|s| {
                s.event_types.iter().any(|t| t == event_type) && s.filters.matches(event_data)
            });
            if matches {
                matched.insert(conn_id.clone());
            }
        }
        matched
    }

    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        let by_connection = self.by_connection.read().expect("subscription lock poisoned");
        let total_subs: usize = by_connection.values().map(Vec::len).sum();
        (by_connection.len(), total_subs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfiltered_subscription_matches_any_payload_of_its_type() {
        let manager = SubscriptionManager::new();
        manager.subscribe("conn-1", "sub-1", vec!["mcp_status_change".to_string()], SubscriptionFilters::default());
        let matched = manager.matching_connections("mcp_status_change", &serde_json::json!({}));
        assert!(matched.contains("conn-1"));
    }

    #[test]
    fn mismatched_event_type_does_not_match() {
        let manager = SubscriptionManager::new();
        manager.subscribe("conn-1", "sub-1", vec!["mcp_status_change".to_string()], SubscriptionFilters::default());
        let matched = manager.matching_connections("circuit_breaker_state", &serde_json::json!({}));
        assert!(!matched.contains("conn-1"));
    }

    #[test]
    fn mcp_names_filter_excludes_other_upstreams() {
        let filters = SubscriptionFilters::from_value(&serde_json::json!({ "mcp_names": ["weather"] }));
        let manager = SubscriptionManager::new();
        manager.subscribe("conn-1", "sub-1", vec!["mcp_status_change".to_string()], filters);

        let matched = manager
            .matching_connections("mcp_status_change", &serde_json::json!({ "mcp_name": "files" }));
        assert!(!matched.contains("conn-1"));

        let matched = manager
            .matching_connections("mcp_status_change", &serde_json::json!({ "mcp_name": "weather" }));
        assert!(matched.contains("conn-1"));
    }

    #[test]
    fn failure_cycles_filter_is_a_minimum() {
        let filters = SubscriptionFilters::from_value(&serde_json::json!({ "failure_cycles": 2 }));
        let manager = SubscriptionManager::new();
        manager.subscribe("conn-1", "sub-1", vec!["circuit_breaker_state".to_string()], filters);

        let matched = manager
            .matching_connections("circuit_breaker_state", &serde_json::json!({ "failure_cycles": 1 }));
        assert!(!matched.contains("conn-1"));

        let matched = manager
            .matching_connections("circuit_breaker_state", &serde_json::json!({ "failure_cycles": 3 }));
        assert!(matched.contains("conn-1"));
    }

    #[test]
    fn unsubscribe_removes_only_named_subscription() {
        let manager = SubscriptionManager::new();
        manager.subscribe("conn-1", "sub-1", vec!["a".to_string()], SubscriptionFilters::default());
        manager.subscribe("conn-1", "sub-2", vec!["b".to_string()], SubscriptionFilters::default());
        assert!(manager.unsubscribe("conn-1", "sub-1"));
        let matched = manager.matching_connections("a", &serde_json::json!({}));
        assert!(!matched.contains("conn-1"));
        let matched = manager.matching_connections("b", &serde_json::json!({}));
        assert!(matched.contains("conn-1"));
    }
}
