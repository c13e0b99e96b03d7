//! LRU cache of `tools/call` results, keyed by upstream, tool, and a
//! canonical hash of the arguments so argument-order doesn't cause spurious
//! misses.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use gateway_core::ToolCallResult;
use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub const DEFAULT_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    result: ToolCallResult,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl ToolCacheStats {
    #[must_use]
    pub fn hit_rate_percent(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct Inner {
    entries: LruCache<String, Entry>,
    stats: ToolCacheStats,
    /// Secondary index so `invalidate_upstream`/`invalidate_tool` don't need
    /// to know the hash of every key; the primary key is a hash and carries
    /// no recoverable structure of its own.
    keys_by_upstream: HashMap<String, HashSet<String>>,
    keys_by_tool: HashMap<(String, String), HashSet<String>>,
}

/// Cache of `tools/call` results. Safe to share behind an `Arc` across
/// dispatcher tasks.
pub struct ToolCache {
    default_ttl: Duration,
    inner: Mutex<Inner>,
}

/// Canonical cache key: stable under key reordering in `arguments` because
/// `serde_json::Value`'s `Ord` sorts object keys when serialized through
/// `to_string` only for `BTreeMap`-backed maps; we sort explicitly instead
/// of relying on that.
#[must_use]
pub fn cache_key(upstream: &str, tool_name: &str, arguments: &Value) -> String {
    let canonical = canonicalize(arguments);
    let mut hasher = Sha256::new();
    hasher.update(upstream.as_bytes());
    hasher.update(b":");
    hasher.update(tool_name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> =
                keys.into_iter().map(|k| format!("\"{k}\":{}", canonicalize(&map[k]))).collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn unindex(inner: &mut Inner, upstream: &str, tool_name: &str, key: &str) {
    if let Some(set) = inner.keys_by_upstream.get_mut(upstream) {
        set.remove(key);
    }
    if let Some(set) = inner.keys_by_tool.get_mut(&(upstream.to_string(), tool_name.to_string())) {
        set.remove(key);
    }
}

impl ToolCache {
    #[must_use]
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            default_ttl,
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: ToolCacheStats::default(),
                keys_by_upstream: HashMap::new(),
                keys_by_tool: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }

    pub fn get(&self, upstream: &str, tool_name: &str, arguments: &Value) -> Option<ToolCallResult> {
        let key = cache_key(upstream, tool_name, arguments);
        let mut inner = self.inner.lock().expect("tool cache lock poisoned");
        if let Some(entry) = inner.entries.get(&key) {
            if Instant::now() < entry.expires_at {
                let result = entry.result.clone();
                inner.stats.hits += 1;
                return Some(result);
            }
            let expired_key = key.clone();
            inner.entries.pop(&expired_key);
            unindex(&mut inner, upstream, tool_name, &expired_key);
        }
        inner.stats.misses += 1;
        None
    }

    pub fn set(&self, upstream: &str, tool_name: &str, arguments: &Value, result: ToolCallResult) {
        let key = cache_key(upstream, tool_name, arguments);
        let expires_at = Instant::now() + self.default_ttl;
        let mut inner = self.inner.lock().expect("tool cache lock poisoned");

        let is_new_key = !inner.entries.contains(&key);
        if is_new_key && inner.entries.len() == inner.entries.cap().get() {
            // We don't know which (upstream, tool) the evicted key belonged
            // to without a reverse lookup; its stale index entries are
            // harmless and are pruned lazily the next time they're touched.
            inner.entries.pop_lru();
            inner.stats.evictions += 1;
        }
        inner.entries.put(key.clone(), Entry { result, expires_at });

        inner.keys_by_upstream.entry(upstream.to_string()).or_default().insert(key.clone());
        inner
            .keys_by_tool
            .entry((upstream.to_string(), tool_name.to_string()))
            .or_default()
            .insert(key);
    }

    /// Drop every cached result for `upstream`, e.g. after it reconnects
    /// with a new tool catalog.
    pub fn invalidate_upstream(&self, upstream: &str) {
        let mut inner = self.inner.lock().expect("tool cache lock poisoned");
        let Some(keys) = inner.keys_by_upstream.remove(upstream) else { return };
        let mut removed = 0u64;
        for key in &keys {
            if inner.entries.pop(key).is_some() {
                removed += 1;
            }
        }
        inner.keys_by_tool.retain(|(u, _), _| u != upstream);
        inner.stats.invalidations += removed;
    }

    /// Drop every cached result for one `(upstream, tool)` pair, e.g. after
    /// a permission change narrows what a user may call.
    pub fn invalidate_tool(&self, upstream: &str, tool_name: &str) {
        let mut inner = self.inner.lock().expect("tool cache lock poisoned");
        let index_key = (upstream.to_string(), tool_name.to_string());
        let Some(keys) = inner.keys_by_tool.remove(&index_key) else { return };
        let mut removed = 0u64;
        for key in &keys {
            if inner.entries.pop(key).is_some() {
                removed += 1;
            }
            if let Some(set) = inner.keys_by_upstream.get_mut(upstream) {
                set.remove(key);
            }
        }
        inner.stats.invalidations += removed;
    }

    #[must_use]
    pub fn stats(&self) -> ToolCacheStats {
        self.inner.lock().expect("tool cache lock poisoned").stats
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("tool cache lock poisoned");
        let cleared = inner.entries.len() as u64;
        inner.entries.clear();
        inner.keys_by_upstream.clear();
        inner.keys_by_tool.clear();
        inner.stats.invalidations += cleared;
    }
}
