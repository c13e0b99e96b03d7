//! The live catalog of upstream MCP servers: their connections, tool
//! catalogs, and health state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gateway_core::{
    build_transport, normalize_mcp_url, McpClient, McpError, McpPrompt, McpResource, McpTool,
    Result as McpResult, ToolCallResult, TransportKind,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;

/// How long an upstream connection may live before the registry proactively
/// renews it on the next reload pass.
pub const CONNECTION_MAX_AGE: Duration = Duration::from_secs(600);

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Declarative configuration for one upstream, as it would arrive from
/// whatever external store owns upstream definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub name: String,
    pub base_url: String,
    pub transport: TransportKind,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStatus {
    Connected,
    Unhealthy,
    Disconnected,
}

impl UpstreamStatus {
    /// Lowercase form used in `mcp_status_change` payloads and filters,
    /// matching the options declared in the event catalog.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamStatus::Connected => "connected",
            UpstreamStatus::Unhealthy => "unhealthy",
            UpstreamStatus::Disconnected => "disconnected",
        }
    }
}

/// Receives notifications of an upstream's health-status transitions, for
/// forwarding onto the event fabric. Mirrors [`crate::BreakerObserver`]'s
/// split from `gateway-events` — this crate has no dependency on it.
pub trait RegistryObserver: Send + Sync {
    fn on_status_change(&self, upstream: &str, old: Option<UpstreamStatus>, new: UpstreamStatus);
}

/// A no-op observer, used when the caller doesn't care about transitions.
pub struct NullRegistryObserver;

impl RegistryObserver for NullRegistryObserver {
    fn on_status_change(&self, _upstream: &str, _old: Option<UpstreamStatus>, _new: UpstreamStatus) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tools: Vec<McpTool>,
    pub prompts: Vec<McpPrompt>,
    pub resources: Vec<McpResource>,
}

struct UpstreamEntry {
    config: UpstreamConfig,
    client: Mutex<Option<McpClient>>,
    status: RwLock<UpstreamStatus>,
    admin_status: RwLock<AdminStatus>,
    catalog: RwLock<Catalog>,
    connected_at: RwLock<Option<Instant>>,
    consecutive_failures: AtomicU32,
    auto_disabled_reason: RwLock<Option<String>>,
}

/// What changed between the registry's in-memory upstream set and a
/// freshly-fetched desired set, from [`Registry::diff`].
#[derive(Debug, Clone, Default)]
pub struct ReloadDiff {
    pub new: Vec<UpstreamConfig>,
    pub removed: Vec<String>,
    pub changed: Vec<UpstreamConfig>,
}

/// Registry of all configured upstream MCP servers.
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<UpstreamEntry>>>,
    breaker: Arc<CircuitBreaker>,
    observer: Arc<dyn RegistryObserver>,
    max_retries: u32,
    retry_delay: Duration,
}

fn is_connection_error(err: &McpError) -> bool {
    matches!(err, McpError::Connect(_) | McpError::Transport(_))
}

impl Registry {
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, observer: Arc<dyn RegistryObserver>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            breaker,
            observer,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// A registry with a [`NullRegistryObserver`], for callers that don't
    /// need to observe status transitions (tests, one-off tools).
    #[must_use]
    pub fn with_null_observer(breaker: Arc<CircuitBreaker>) -> Self {
        Self::new(breaker, Arc::new(NullRegistryObserver))
    }

    /// Connect to `config` and fetch its catalogs, retrying connection
    /// errors up to `max_retries` times. Skips entirely if the upstream's
    /// breaker is currently open.
    pub async fn load(&self, config: UpstreamConfig) -> McpResult<()> {
        if self.breaker.is_open(&config.name) {
            debug!(upstream = %config.name, "circuit open, skipping load");
            return Err(McpError::CircuitOpen(config.name.clone()));
        }

        let url = normalize_mcp_url(&config.base_url);
        let auth_header = config.auth_token.as_ref().map(|t| format!("Bearer {t}"));

        let mut attempt = 0;
        let mut client = loop {
            let transport = build_transport(config.transport, &url);
            match McpClient::connect(config.name.clone(), transport, auth_header.clone()).await {
                Ok(client) => break client,
                Err(e) if is_connection_error(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(upstream = %config.name, attempt, error = %e, "retrying connection");
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
                Err(e) => {
                    self.record_failure(&config.name, &e).await;
                    return Err(e);
                }
            }
        };

        let (tools, prompts, resources) = match self.fetch_catalogs(&config.name, &mut client).await {
            Ok(catalogs) => catalogs,
            Err(e) => {
                self.record_failure(&config.name, &e).await;
                return Err(e);
            }
        };
        self.breaker.record_success(&config.name);

        let entry = Arc::new(UpstreamEntry {
            config: config.clone(),
            client: Mutex::new(Some(client)),
            status: RwLock::new(UpstreamStatus::Connected),
            admin_status: RwLock::new(AdminStatus::Active),
            catalog: RwLock::new(Catalog { tools, prompts, resources }),
            connected_at: RwLock::new(Some(Instant::now())),
            consecutive_failures: AtomicU32::new(0),
            auto_disabled_reason: RwLock::new(None),
        });

        self.entries.write().await.insert(config.name.clone(), entry);
        info!(upstream = %config.name, "upstream loaded");
        self.observer.on_status_change(&config.name, None, UpstreamStatus::Connected);
        Ok(())
    }

    async fn fetch_catalogs(
        &self,
        name: &str,
        client: &mut McpClient,
    ) -> McpResult<(Vec<McpTool>, Vec<McpPrompt>, Vec<McpResource>)> {
        let tools = client.list_tools().await?;

        let prompts = match client.list_prompts().await {
            Ok(p) => p,
            Err(e) if e.is_method_not_found() => Vec::new(),
            Err(e) => {
                debug!(upstream = %name, error = %e, "prompts/list not supported, treating as empty");
                Vec::new()
            }
        };

        let resources = match client.list_resources().await {
            Ok(r) => r,
            Err(e) if e.is_method_not_found() => Vec::new(),
            Err(e) => {
                debug!(upstream = %name, error = %e, "resources/list not supported, treating as empty");
                Vec::new()
            }
        };

        Ok((tools, prompts, resources))
    }

    /// Re-establish a fresh session for an already-loaded upstream, e.g.
    /// because [`Registry::stale_connections`] flagged it for renewal.
    pub async fn reconnect(&self, name: &str) -> McpResult<()> {
        let entries = self.entries.read().await;
        let entry = entries.get(name).ok_or_else(|| McpError::NoSession(name.to_string()))?.clone();
        drop(entries);

        let url = normalize_mcp_url(&entry.config.base_url);
        let auth_header = entry.config.auth_token.as_ref().map(|t| format!("Bearer {t}"));
        let transport = build_transport(entry.config.transport, &url);
        let mut client = McpClient::connect(entry.config.name.clone(), transport, auth_header).await?;
        let (tools, prompts, resources) = self.fetch_catalogs(name, &mut client).await?;

        *entry.client.lock().await = Some(client);
        *entry.connected_at.write().await = Some(Instant::now());
        *entry.catalog.write().await = Catalog { tools, prompts, resources };
        *entry.status.write().await = UpstreamStatus::Connected;
        Ok(())
    }

    async fn record_failure(&self, name: &str, err: &McpError) {
        if !err.counts_against_breaker() {
            return;
        }
        self.breaker.record_failure(name);
        if let Some(entry) = self.entries.read().await.get(name) {
            entry.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            if self.breaker.should_auto_disable(name) {
                *entry.admin_status.write().await = AdminStatus::Inactive;
                *entry.auto_disabled_reason.write().await =
                    Some(format!("circuit breaker exceeded max failure cycles: {err}"));
                warn!(upstream = name, "upstream auto-disabled");
            } else {
                let old = *entry.status.read().await;
                *entry.status.write().await = UpstreamStatus::Unhealthy;
                if old != UpstreamStatus::Unhealthy {
                    self.observer.on_status_change(name, Some(old), UpstreamStatus::Unhealthy);
                }
            }
        }
    }

    /// Unload an upstream, dropping its session and catalog.
    pub async fn unload(&self, name: &str) -> Option<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.remove(name)?;
        *entry.client.lock().await = None;
        let old = *entry.status.read().await;
        self.observer.on_status_change(name, Some(old), UpstreamStatus::Disconnected);
        Some(())
    }

    /// Call a tool on `upstream` by its own (unmangled) name. Checks the
    /// breaker before contacting the upstream; a tripped breaker short
    /// circuits without a network round trip.
    pub async fn call_tool(
        &self,
        upstream: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> McpResult<ToolCallResult> {
        if self.breaker.is_open(upstream) {
            return Err(McpError::CircuitOpen(upstream.to_string()));
        }

        let entries = self.entries.read().await;
        let entry = entries.get(upstream).ok_or_else(|| McpError::NoSession(upstream.to_string()))?.clone();
        drop(entries);

        let mut client_guard = entry.client.lock().await;
        let client = client_guard.as_mut().ok_or_else(|| McpError::NoSession(upstream.to_string()))?;
        let result = client.call_tool(tool_name, arguments).await;
        drop(client_guard);

        match &result {
            Ok(_) => self.breaker.record_success(upstream),
            Err(e) if e.counts_against_breaker() => self.record_failure(upstream, e).await,
            Err(_) => {}
        }
        result
    }

    /// Fetch a prompt from `upstream` by its own (unmangled) name.
    pub async fn get_prompt(
        &self,
        upstream: &str,
        prompt_name: &str,
        arguments: serde_json::Value,
    ) -> McpResult<serde_json::Value> {
        if self.breaker.is_open(upstream) {
            return Err(McpError::CircuitOpen(upstream.to_string()));
        }

        let entries = self.entries.read().await;
        let entry = entries.get(upstream).ok_or_else(|| McpError::NoSession(upstream.to_string()))?.clone();
        drop(entries);

        let mut client_guard = entry.client.lock().await;
        let client = client_guard.as_mut().ok_or_else(|| McpError::NoSession(upstream.to_string()))?;
        let result = client.get_prompt(prompt_name, Some(arguments)).await;
        drop(client_guard);

        match &result {
            Ok(_) => self.breaker.record_success(upstream),
            Err(e) if e.counts_against_breaker() => self.record_failure(upstream, e).await,
            Err(_) => {}
        }
        result
    }

    /// Read a resource from `upstream` by its own (unmangled) URI.
    pub async fn read_resource(&self, upstream: &str, uri: &str) -> McpResult<serde_json::Value> {
        if self.breaker.is_open(upstream) {
            return Err(McpError::CircuitOpen(upstream.to_string()));
        }

        let entries = self.entries.read().await;
        let entry = entries.get(upstream).ok_or_else(|| McpError::NoSession(upstream.to_string()))?.clone();
        drop(entries);

        let mut client_guard = entry.client.lock().await;
        let client = client_guard.as_mut().ok_or_else(|| McpError::NoSession(upstream.to_string()))?;
        let result = client.read_resource(uri).await;
        drop(client_guard);

        match &result {
            Ok(_) => self.breaker.record_success(upstream),
            Err(e) if e.counts_against_breaker() => self.record_failure(upstream, e).await,
            Err(_) => {}
        }
        result
    }

    /// The configuration an upstream was last loaded with, or `None` if not
    /// loaded — used by the coordinator to re-queue a config for recovery
    /// after a health-check failure unloads it.
    pub async fn config(&self, upstream: &str) -> Option<UpstreamConfig> {
        let entries = self.entries.read().await;
        Some(entries.get(upstream)?.config.clone())
    }

    /// Snapshot of one upstream's catalog, or `None` if not loaded.
    pub async fn catalog(&self, upstream: &str) -> Option<Catalog> {
        let entries = self.entries.read().await;
        let entry = entries.get(upstream)?;
        Some(entry.catalog.read().await.clone())
    }

    /// Every currently-loaded upstream whose admin status is active.
    pub async fn active_upstreams(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut names = Vec::new();
        for (name, entry) in entries.iter() {
            if *entry.admin_status.read().await == AdminStatus::Active {
                names.push(name.clone());
            }
        }
        names
    }

    pub async fn status(&self, upstream: &str) -> Option<UpstreamStatus> {
        let entries = self.entries.read().await;
        let entry = entries.get(upstream)?;
        Some(*entry.status.read().await)
    }

    /// The breaker's current state for `upstream`, for status surfaces
    /// (the WebSocket initial snapshot, admin listings) that need both the
    /// connection status and the breaker state side by side.
    pub fn circuit_state(&self, upstream: &str) -> crate::circuit_breaker::CircuitState {
        self.breaker.state(upstream)
    }

    /// Seconds remaining until `upstream`'s open circuit transitions to
    /// half-open, for the typed "unavailable" tool-call result. `None` when
    /// the circuit isn't open.
    #[must_use]
    pub fn retry_after(&self, upstream: &str) -> Option<u64> {
        self.breaker.retry_after(upstream)
    }

    /// Names of every upstream that currently has an open session,
    /// regardless of admin status — the health-check loop's probe set.
    pub async fn loaded_upstreams(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Send a lightweight `ping` to `upstream` to detect a silently-dead
    /// session between catalog refreshes. Skips upstreams with an open
    /// breaker, same as every other request path. Failure is recorded
    /// against the breaker and flips the upstream unhealthy, matching
    /// [`Self::call_tool`]'s bookkeeping.
    pub async fn health_check(&self, upstream: &str) -> McpResult<()> {
        if self.breaker.is_open(upstream) {
            return Err(McpError::CircuitOpen(upstream.to_string()));
        }

        let entries = self.entries.read().await;
        let entry = entries.get(upstream).ok_or_else(|| McpError::NoSession(upstream.to_string()))?.clone();
        drop(entries);

        let mut client_guard = entry.client.lock().await;
        let client = client_guard.as_mut().ok_or_else(|| McpError::NoSession(upstream.to_string()))?;
        let result = client.ping().await;
        drop(client_guard);

        match &result {
            Ok(()) => self.breaker.record_success(upstream),
            Err(e) if e.counts_against_breaker() => self.record_failure(upstream, e).await,
            Err(_) => {}
        }
        result
    }

    /// Upstreams older than [`CONNECTION_MAX_AGE`], which `reload` should
    /// renew on its next pass.
    pub async fn stale_connections(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut stale = Vec::new();
        for (name, entry) in entries.iter() {
            let age = entry.connected_at.read().await.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
            if age > CONNECTION_MAX_AGE {
                stale.push(name.clone());
            }
        }
        stale
    }

    /// Diff the registry's current upstream set against a freshly-fetched
    /// desired configuration list.
    pub async fn diff(&self, desired: &[UpstreamConfig]) -> ReloadDiff {
        let entries = self.entries.read().await;
        let current_names: HashSet<&String> = entries.keys().collect();
        let desired_by_name: HashMap<&str, &UpstreamConfig> =
            desired.iter().map(|c| (c.name.as_str(), c)).collect();

        let mut diff = ReloadDiff::default();
        for config in desired {
            match entries.get(&config.name) {
                None => diff.new.push(config.clone()),
                Some(entry) if entry.config != *config => diff.changed.push(config.clone()),
                Some(_) => {}
            }
        }
        for name in current_names {
            if !desired_by_name.contains_key(name.as_str()) {
                diff.removed.push(name.clone());
            }
        }
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;

    fn config(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            base_url: format!("https://{name}.example/"),
            transport: TransportKind::HttpStreamable,
            auth_token: None,
        }
    }

    #[tokio::test]
    async fn diff_classifies_new_removed_and_changed() {
        let registry = Registry::with_null_observer(Arc::new(CircuitBreaker::with_defaults()));
        registry.entries.write().await.insert(
            "weather".to_string(),
            Arc::new(UpstreamEntry {
                config: config("weather"),
                client: Mutex::new(None),
                status: RwLock::new(UpstreamStatus::Connected),
                admin_status: RwLock::new(AdminStatus::Active),
                catalog: RwLock::new(Catalog::default()),
                connected_at: RwLock::new(Some(Instant::now())),
                consecutive_failures: AtomicU32::new(0),
                auto_disabled_reason: RwLock::new(None),
            }),
        );
        registry.entries.write().await.insert(
            "stale-svc".to_string(),
            Arc::new(UpstreamEntry {
                config: config("stale-svc"),
                client: Mutex::new(None),
                status: RwLock::new(UpstreamStatus::Connected),
                admin_status: RwLock::new(AdminStatus::Active),
                catalog: RwLock::new(Catalog::default()),
                connected_at: RwLock::new(Some(Instant::now())),
                consecutive_failures: AtomicU32::new(0),
                auto_disabled_reason: RwLock::new(None),
            }),
        );

        let mut changed_weather = config("weather");
        changed_weather.base_url = "https://weather-v2.example/".to_string();

        let desired = vec![changed_weather.clone(), config("files")];
        let diff = registry.diff(&desired).await;

        assert_eq!(diff.new, vec![config("files")]);
        assert_eq!(diff.changed, vec![changed_weather]);
        assert_eq!(diff.removed, vec!["stale-svc".to_string()]);
    }

    #[tokio::test]
    async fn call_tool_without_loaded_upstream_errors_no_session() {
        let registry = Registry::with_null_observer(Arc::new(CircuitBreaker::with_defaults()));
        let err = registry.call_tool("ghost", "anything", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::NoSession(_)));
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_call_tool() {
        let breaker = Arc::new(CircuitBreaker::with_defaults());
        for _ in 0..5 {
            breaker.record_failure("weather");
        }
        let registry = Registry::with_null_observer(breaker);
        let err = registry.call_tool("weather", "get_forecast", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_health_check() {
        let breaker = Arc::new(CircuitBreaker::with_defaults());
        for _ in 0..5 {
            breaker.record_failure("weather");
        }
        let registry = Registry::with_null_observer(breaker);
        let err = registry.health_check("weather").await.unwrap_err();
        assert!(matches!(err, McpError::CircuitOpen(_)));
    }

    struct RecordingObserver {
        events: Mutex<Vec<(String, Option<UpstreamStatus>, UpstreamStatus)>>,
    }

    impl RecordingObserver {
        fn new() -> Self {
            Self { events: Mutex::new(Vec::new()) }
        }
    }

    impl RegistryObserver for RecordingObserver {
        fn on_status_change(&self, upstream: &str, old: Option<UpstreamStatus>, new: UpstreamStatus) {
            self.events.try_lock().expect("test observer lock contended").push((upstream.to_string(), old, new));
        }
    }

    #[tokio::test]
    async fn unload_emits_disconnected_status_change() {
        let observer = Arc::new(RecordingObserver::new());
        let registry = Registry::new(Arc::new(CircuitBreaker::with_defaults()), observer.clone());
        registry.entries.write().await.insert(
            "weather".to_string(),
            Arc::new(UpstreamEntry {
                config: config("weather"),
                client: Mutex::new(None),
                status: RwLock::new(UpstreamStatus::Connected),
                admin_status: RwLock::new(AdminStatus::Active),
                catalog: RwLock::new(Catalog::default()),
                connected_at: RwLock::new(Some(Instant::now())),
                consecutive_failures: AtomicU32::new(0),
                auto_disabled_reason: RwLock::new(None),
            }),
        );

        registry.unload("weather").await;

        let events = observer.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], ("weather".to_string(), Some(UpstreamStatus::Connected), UpstreamStatus::Disconnected));
    }
}
