//! Per-user tool/resource/prompt filtering.
//!
//! A restriction travels as opaque JSON from whatever external store owns
//! user-to-mcp grants, since that store is out of scope here. Two shapes
//! are accepted: a bare list (tool names only) or an object with distinct
//! `tools`/`resources`/`prompts` lists. `["*"]` means "everything";
//! missing/null/undecodable means "everything" too, so a misconfigured
//! restriction fails open rather than locking a user out entirely.

use std::collections::HashSet;

use gateway_core::{McpPrompt, McpResource, McpTool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const WILDCARD: &str = "*";

/// One upstream's restriction entry, after decoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Restriction {
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub resources: Option<Vec<String>>,
    #[serde(default)]
    pub prompts: Option<Vec<String>>,
}

impl Restriction {
    fn allows(allowed: &Option<Vec<String>>, name: &str) -> bool {
        match allowed {
            None => true,
            Some(list) if list.iter().any(|v| v == WILDCARD) => true,
            Some(list) => list.iter().any(|v| v == name),
        }
    }

    #[must_use]
    pub fn allows_tool(&self, name: &str) -> bool {
        Self::allows(&self.tools, name)
    }

    #[must_use]
    pub fn allows_resource(&self, uri: &str) -> bool {
        Self::allows(&self.resources, uri)
    }

    #[must_use]
    pub fn allows_prompt(&self, name: &str) -> bool {
        Self::allows(&self.prompts, name)
    }

    /// Parse a restriction from whatever the access store gave us: a JSON
    /// string to decode, an already-decoded object/array, or nothing.
    /// Any shape this function can't make sense of is treated as "allow
    /// everything" rather than surfaced as an error.
    #[must_use]
    pub fn from_value(raw: Option<&Value>) -> Self {
        let Some(raw) = raw else { return Self::default() };

        let parsed = match raw {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "tool restriction was not valid JSON, allowing all");
                    return Self::default();
                }
            },
            other => other.clone(),
        };

        match parsed {
            Value::Null => Self::default(),
            Value::Array(items) => {
                let tools = items.into_iter().filter_map(|v| v.as_str().map(String::from)).collect();
                Self { tools: Some(tools), resources: None, prompts: None }
            }
            Value::Object(_) => serde_json::from_value(parsed).unwrap_or_else(|e| {
                warn!(error = %e, "tool restriction object had an unexpected shape, allowing all");
                Self::default()
            }),
            _ => Self::default(),
        }
    }
}

/// Per-user, per-upstream restrictions, keyed by upstream name.
#[derive(Debug, Clone, Default)]
pub struct PermissionGrant {
    pub available_mcps: HashSet<String>,
    pub restrictions: std::collections::HashMap<String, Restriction>,
}

impl PermissionGrant {
    fn restriction_for(&self, upstream: &str) -> Restriction {
        self.restrictions.get(upstream).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn can_call_tool(&self, upstream: &str, tool_name: &str) -> bool {
        self.available_mcps.contains(upstream) && self.restriction_for(upstream).allows_tool(tool_name)
    }

    #[must_use]
    pub fn can_read_resource(&self, upstream: &str, uri: &str) -> bool {
        self.available_mcps.contains(upstream) && self.restriction_for(upstream).allows_resource(uri)
    }

    #[must_use]
    pub fn can_get_prompt(&self, upstream: &str, prompt_name: &str) -> bool {
        self.available_mcps.contains(upstream) && self.restriction_for(upstream).allows_prompt(prompt_name)
    }

    /// Filter a catalog of tools fetched from `upstream` down to what this
    /// user may call.
    #[must_use]
    pub fn filter_tools(&self, upstream: &str, tools: Vec<McpTool>) -> Vec<McpTool> {
        if !self.available_mcps.contains(upstream) {
            return Vec::new();
        }
        let restriction = self.restriction_for(upstream);
        tools.into_iter().filter(|t| restriction.allows_tool(&t.name)).collect()
    }

    #[must_use]
    pub fn filter_resources(&self, upstream: &str, resources: Vec<McpResource>) -> Vec<McpResource> {
        if !self.available_mcps.contains(upstream) {
            return Vec::new();
        }
        let restriction = self.restriction_for(upstream);
        resources.into_iter().filter(|r| restriction.allows_resource(&r.uri)).collect()
    }

    #[must_use]
    pub fn filter_prompts(&self, upstream: &str, prompts: Vec<McpPrompt>) -> Vec<McpPrompt> {
        if !self.available_mcps.contains(upstream) {
            return Vec::new();
        }
        let restriction = self.restriction_for(upstream);
        prompts.into_iter().filter(|p| restriction.allows_prompt(&p.name)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> McpTool {
        McpTool { name: name.to_string(), description: None, input_schema: None }
    }

    #[test]
    fn missing_restriction_allows_all() {
        let r = Restriction::from_value(None);
        assert!(r.allows_tool("anything"));
    }

    #[test]
    fn wildcard_list_allows_all() {
        let r = Restriction::from_value(Some(&serde_json::json!(["*"])));
        assert!(r.allows_tool("anything"));
    }

    #[test]
    fn empty_list_allows_none() {
        let r = Restriction::from_value(Some(&serde_json::json!([])));
        assert!(!r.allows_tool("anything"));
    }

    #[test]
    fn flat_array_restricts_tools_only() {
        let r = Restriction::from_value(Some(&serde_json::json!(["get_weather"])));
        assert!(r.allows_tool("get_weather"));
        assert!(!r.allows_tool("delete_everything"));
        assert!(r.allows_resource("file:///anything"));
    }

    #[test]
    fn json_string_is_decoded() {
        let r = Restriction::from_value(Some(&Value::String(r#"["get_weather"]"#.to_string())));
        assert!(r.allows_tool("get_weather"));
        assert!(!r.allows_tool("other"));
    }

    #[test]
    fn malformed_json_string_fails_open() {
        let r = Restriction::from_value(Some(&Value::String("not json at all".to_string())));
        assert!(r.allows_tool("anything"));
    }

    #[test]
    fn object_shape_restricts_per_category() {
        let r = Restriction::from_value(Some(&serde_json::json!({
            "tools": ["get_weather"],
            "resources": ["*"],
            "prompts": [],
        })));
        assert!(r.allows_tool("get_weather"));
        assert!(!r.allows_tool("other"));
        assert!(r.allows_resource("file:///anything"));
        assert!(!r.allows_prompt("summarize"));
    }

    #[test]
    fn filter_tools_drops_unavailable_upstream_entirely() {
        let grant = PermissionGrant::default();
        let filtered = grant.filter_tools("weather", vec![tool("get_forecast")]);
        assert!(filtered.is_empty());
    }

    #[test]
    fn filter_tools_respects_restriction_for_available_upstream() {
        let mut grant = PermissionGrant::default();
        grant.available_mcps.insert("weather".to_string());
        grant.restrictions.insert(
            "weather".to_string(),
            Restriction { tools: Some(vec!["get_forecast".to_string()]), resources: None, prompts: None },
        );
        let filtered =
            grant.filter_tools("weather", vec![tool("get_forecast"), tool("delete_region")]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "get_forecast");
    }
}
