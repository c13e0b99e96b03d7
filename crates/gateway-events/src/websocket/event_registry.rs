//! Static catalog of event types the gateway can emit over `/ws`, returned
//! to clients via the `get_metadata` action so a dashboard can build its
//! filter UI without hardcoding event shapes.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Mcp,
    System,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventField {
    pub name: &'static str,
    pub label: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<&'static [&'static str]>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventTypeInfo {
    pub id: &'static str,
    pub category: EventCategory,
    pub label: &'static str,
    pub description: &'static str,
    pub severity_levels: &'static [&'static str],
    pub filterable_fields: &'static [EventField],
}

const SEVERITY_LEVELS: &[&str] = &["info", "warning", "critical"];

const MCP_STATUS_CHANGE: EventTypeInfo = EventTypeInfo {
    id: "mcp_status_change",
    category: EventCategory::Mcp,
    label: "Upstream status changed",
    description: "An upstream MCP server transitioned between connected, unhealthy, or disconnected",
    severity_levels: SEVERITY_LEVELS,
    filterable_fields: &[
        EventField { name: "mcp_names", label: "Upstream", kind: "multiselect", options: None },
        EventField {
            name: "old_status",
            label: "Previous status",
            kind: "select",
            options: Some(&["connected", "unhealthy", "disconnected"]),
        },
        EventField {
            name: "new_status",
            label: "New status",
            kind: "select",
            options: Some(&["connected", "unhealthy", "disconnected"]),
        },
    ],
};

const CIRCUIT_BREAKER_STATE: EventTypeInfo = EventTypeInfo {
    id: "circuit_breaker_state",
    category: EventCategory::Mcp,
    label: "Circuit breaker state changed",
    description: "An upstream's circuit breaker opened, half-opened, or closed",
    severity_levels: SEVERITY_LEVELS,
    filterable_fields: &[
        EventField { name: "mcp_names", label: "Upstream", kind: "multiselect", options: None },
        EventField {
            name: "state",
            label: "Circuit state",
            kind: "multiselect",
            options: Some(&["closed", "open", "half_open"]),
        },
        EventField { name: "failure_cycles", label: "Minimum failure cycles", kind: "number", options: None },
    ],
};

const MCP_AUTO_DISABLED: EventTypeInfo = EventTypeInfo {
    id: "mcp_auto_disabled",
    category: EventCategory::Mcp,
    label: "Upstream auto-disabled",
    description: "An upstream was automatically marked inactive after repeated circuit breaker trips",
    severity_levels: &["critical"],
    filterable_fields: &[EventField { name: "mcp_names", label: "Upstream", kind: "multiselect", options: None }],
};

const COMPONENT_HEALTH: EventTypeInfo = EventTypeInfo {
    id: "component_health",
    category: EventCategory::System,
    label: "Internal component health changed",
    description: "A background listener connected, reconnected, or stopped",
    severity_levels: SEVERITY_LEVELS,
    filterable_fields: &[EventField {
        name: "health_status",
        label: "Status",
        kind: "multiselect",
        options: Some(&["connected", "reconnecting", "stopped"]),
    }],
};

const EVENT_REGISTRY: &[EventTypeInfo] =
    &[MCP_STATUS_CHANGE, CIRCUIT_BREAKER_STATE, MCP_AUTO_DISABLED, COMPONENT_HEALTH];

/// Look up one event type's metadata by id.
#[must_use]
pub fn get_event_type(id: &str) -> Option<&'static EventTypeInfo> {
    EVENT_REGISTRY.iter().find(|e| e.id == id)
}

/// The full registry, serialized for the `get_metadata` WebSocket action.
#[must_use]
pub fn event_metadata() -> Value {
    serde_json::to_value(EVENT_REGISTRY).unwrap_or(Value::Array(vec![]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_registered_event_type_is_discoverable_by_id() {
        for event in EVENT_REGISTRY {
            assert!(get_event_type(event.id).is_some());
        }
    }

    #[test]
    fn event_metadata_serializes_as_a_non_empty_array() {
        let metadata = event_metadata();
        assert!(metadata.as_array().unwrap().len() >= EVENT_REGISTRY.len());
    }
}
