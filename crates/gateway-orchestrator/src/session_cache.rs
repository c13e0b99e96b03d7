//! Short-lived cache of a user's resolved gateway session: which upstreams
//! they may see and which tools/resources/prompts survive permission
//! filtering. Re-deriving this on every request would mean re-validating
//! the caller's token and re-running the permission filter per call; a 60
//! second TTL keeps that cost off the hot path while still bounding how
//! long a just-revoked grant stays visible.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use gateway_core::{McpPrompt, McpResource, McpTool};

/// Default lifetime of a cached session. Chosen short specifically because
/// this cache stands in for token validation, not because upstream catalogs
/// change quickly.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CachedSession {
    pub user_id: String,
    pub available_mcps: Vec<String>,
    pub filtered_tools: Option<Vec<McpTool>>,
    pub filtered_prompts: Option<Vec<McpPrompt>>,
    pub filtered_resources: Option<Vec<McpResource>>,
    pub flow_session_id: Option<String>,
    created_at: Instant,
    last_accessed: Instant,
}

struct Entry {
    session: CachedSession,
    expires_at: Instant,
}

/// Keyed by `(user_id, flow_session_id.unwrap_or_default())` so the same
/// user can hold independent caches per upstream flow session.
pub struct SessionCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

fn cache_key(user_id: &str, flow_session_id: Option<&str>) -> String {
    format!("{user_id}:{}", flow_session_id.unwrap_or(""))
}

impl SessionCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()) }
    }

    #[must_use]
    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL)
    }

    /// Returns a clone of the cached session and bumps `last_accessed`, or
    /// `None` if absent or expired.
    pub fn get(&self, user_id: &str, flow_session_id: Option<&str>) -> Option<CachedSession> {
        let key = cache_key(user_id, flow_session_id);
        let mut entries = self.entries.write().expect("session cache lock poisoned");
        let entry = entries.get_mut(&key)?;
        if Instant::now() >= entry.expires_at {
            entries.remove(&key);
            return None;
        }
        entry.session.last_accessed = Instant::now();
        Some(entry.session.clone())
    }

    /// Overwrite `(user_id, flow_session_id)` with a fresh session carrying
    /// only the catalog kind just computed; the other two kinds start
    /// uncached and are filled in by later calls via [`Self::set_tools`] /
    /// [`Self::set_prompts`] / [`Self::set_resources`], which preserve
    /// whatever is already cached for the others.
    pub fn set(
        &self,
        user_id: impl Into<String>,
        flow_session_id: Option<String>,
        available_mcps: Vec<String>,
        filtered_tools: Vec<McpTool>,
    ) {
        let user_id = user_id.into();
        let key = cache_key(&user_id, flow_session_id.as_deref());
        let now = Instant::now();
        let session = CachedSession {
            user_id,
            available_mcps,
            filtered_tools: Some(filtered_tools),
            filtered_prompts: None,
            filtered_resources: None,
            flow_session_id,
            created_at: now,
            last_accessed: now,
        };
        let mut entries = self.entries.write().expect("session cache lock poisoned");
        entries.insert(key, Entry { session, expires_at: now + self.ttl });
    }

    fn upsert(
        &self,
        user_id: &str,
        flow_session_id: Option<&str>,
        available_mcps: &[String],
        update: impl FnOnce(&mut CachedSession),
    ) {
        let key = cache_key(user_id, flow_session_id);
        let now = Instant::now();
        let mut entries = self.entries.write().expect("session cache lock poisoned");
        let entry = entries.entry(key).or_insert_with(|| Entry {
            session: CachedSession {
                user_id: user_id.to_string(),
                available_mcps: available_mcps.to_vec(),
                filtered_tools: None,
                filtered_prompts: None,
                filtered_resources: None,
                flow_session_id: flow_session_id.map(str::to_string),
                created_at: now,
                last_accessed: now,
            },
            expires_at: now + self.ttl,
        });
        update(&mut entry.session);
        entry.expires_at = now + self.ttl;
    }

    pub fn set_tools(
        &self,
        user_id: &str,
        flow_session_id: Option<&str>,
        available_mcps: &[String],
        tools: Vec<McpTool>,
    ) {
        self.upsert(user_id, flow_session_id, available_mcps, |s| s.filtered_tools = Some(tools));
    }

    pub fn set_prompts(
        &self,
        user_id: &str,
        flow_session_id: Option<&str>,
        available_mcps: &[String],
        prompts: Vec<McpPrompt>,
    ) {
        self.upsert(user_id, flow_session_id, available_mcps, |s| s.filtered_prompts = Some(prompts));
    }

    pub fn set_resources(
        &self,
        user_id: &str,
        flow_session_id: Option<&str>,
        available_mcps: &[String],
        resources: Vec<McpResource>,
    ) {
        self.upsert(user_id, flow_session_id, available_mcps, |s| s.filtered_resources = Some(resources));
    }

    /// Invalidate one `(user_id, flow_session_id)` pair.
    pub fn invalidate(&self, user_id: &str, flow_session_id: Option<&str>) {
        let key = cache_key(user_id, flow_session_id);
        self.entries.write().expect("session cache lock poisoned").remove(&key);
    }

    /// Invalidate every cached session for `user_id`, across all flow
    /// sessions. Called when a `user_blocked` event names `"mcp"` among the
    /// blocked services.
    pub fn invalidate_user(&self, user_id: &str) {
        let mut entries = self.entries.write().expect("session cache lock poisoned");
        entries.retain(|_, entry| entry.session.user_id != user_id);
    }

    /// Drop expired entries proactively; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("session cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("session cache lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set("alice", None, vec!["weather".to_string()], vec![]);
        let session = cache.get("alice", None).unwrap();
        assert_eq!(session.user_id, "alice");
        assert_eq!(session.available_mcps, vec!["weather".to_string()]);
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let cache = SessionCache::new(Duration::from_millis(10));
        cache.set("alice", None, vec![], vec![]);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("alice", None).is_none());
    }

    #[test]
    fn distinct_flow_sessions_are_independent() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set("alice", Some("flow-1".to_string()), vec!["a".to_string()], vec![]);
        cache.set("alice", Some("flow-2".to_string()), vec!["b".to_string()], vec![]);
        assert_eq!(
            cache.get("alice", Some("flow-1")).unwrap().available_mcps,
            vec!["a".to_string()]
        );
        assert_eq!(
            cache.get("alice", Some("flow-2")).unwrap().available_mcps,
            vec!["b".to_string()]
        );
    }

    #[test]
    fn invalidate_user_clears_every_flow_session() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set("alice", Some("flow-1".to_string()), vec![], vec![]);
        cache.set("alice", Some("flow-2".to_string()), vec![], vec![]);
        cache.set("bob", None, vec![], vec![]);
        cache.invalidate_user("alice");
        assert!(cache.get("alice", Some("flow-1")).is_none());
        assert!(cache.get("alice", Some("flow-2")).is_none());
        assert!(cache.get("bob", None).is_some());
    }

    #[test]
    fn cleanup_expired_removes_only_stale_entries() {
        let cache = SessionCache::new(Duration::from_millis(10));
        cache.set("alice", None, vec![], vec![]);
        std::thread::sleep(Duration::from_millis(20));
        cache.set("bob", None, vec![], vec![]);
        let removed = cache.cleanup_expired();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn set_prompts_preserves_tools_already_cached_for_the_same_session() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set_tools("alice", None, &["weather".to_string()], vec![]);
        cache.set_prompts("alice", None, &["weather".to_string()], vec![]);
        let session = cache.get("alice", None).unwrap();
        assert!(session.filtered_tools.is_some());
        assert!(session.filtered_prompts.is_some());
        assert!(session.filtered_resources.is_none());
    }
}
