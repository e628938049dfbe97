//! In-memory cache for workflow documents and definitions.
//!
//! Entries expire after a TTL and can be tied to a backing file: when the
//! file's content hash changes, the entry is dropped on the next lookup.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Default time-to-live for cached values.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// A cached value with expiry and file-hash metadata.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    /// `None` means the entry never expires
    ttl: Option<Duration>,
    created_at: Instant,
    file_hash: Option<String>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.created_at.elapsed() >= ttl)
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Whether the cache is accepting reads and writes
    pub enabled: bool,
    /// Live entries
    pub entries: usize,
    /// Successful lookups
    pub hits: u64,
    /// Failed lookups
    pub misses: u64,
    /// Entries dropped by expiry, hash mismatch, or explicit invalidation
    pub invalidations: u64,
}

impl CacheStats {
    /// Hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

/// Thread-safe TTL cache keyed by string.
#[derive(Debug)]
pub struct WorkflowCache {
    inner: Mutex<CacheInner>,
    enabled: AtomicBool,
    default_ttl: Option<Duration>,
}

impl Default for WorkflowCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl WorkflowCache {
    /// Create a cache. A zero `default_ttl` means entries never expire.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            enabled: AtomicBool::new(true),
            default_ttl: (!default_ttl.is_zero()).then_some(default_ttl),
        }
    }

    /// Look up a value, validating it against `file` if one is given.
    pub fn get(&self, key: &str, file: Option<&Path>) -> Option<Value> {
        if !self.is_enabled() {
            return None;
        }

        let mut inner = self.inner.lock();

        let Some(entry) = inner.entries.get(key) else {
            inner.misses += 1;
            return None;
        };

        let stale = entry.is_expired()
            || match (file, entry.file_hash.as_deref()) {
                (Some(path), Some(expected)) => file_hash(path).as_deref() != Some(expected),
                _ => false,
            };

        if stale {
            inner.entries.remove(key);
            inner.misses += 1;
            inner.invalidations += 1;
            return None;
        }

        let value = entry.value.clone();
        inner.hits += 1;
        Some(value)
    }

    /// Store a value with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: Value, file: Option<&Path>) {
        self.set_with_ttl(key, value, self.default_ttl, file);
    }

    /// Store a value with an explicit TTL (`None` never expires).
    pub fn set_with_ttl(
        &self,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
        file: Option<&Path>,
    ) {
        if !self.is_enabled() {
            return;
        }

        let entry = CacheEntry {
            value,
            ttl,
            created_at: Instant::now(),
            file_hash: file.and_then(file_hash),
        };
        self.inner.lock().entries.insert(key.into(), entry);
    }

    /// Drop one entry.
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key).is_some() {
            inner.invalidations += 1;
        }
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = (before - inner.entries.len()) as u64;
        inner.invalidations += removed;
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len() as u64;
        inner.entries.clear();
        inner.invalidations += removed;
    }

    /// Turn caching on.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Turn caching off. Lookups miss and writes are ignored.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether caching is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            enabled: self.is_enabled(),
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            invalidations: inner.invalidations,
        }
    }

    /// Zero the counters, keeping entries.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.invalidations = 0;
    }
}

/// SHA-256 of a file's content, hex encoded.
fn file_hash(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let digest = Sha256::digest(&bytes);
    Some(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_set_and_get() {
        let cache = WorkflowCache::default();
        cache.set("key", json!({"data": 1}), None);
        assert_eq!(cache.get("key", None), Some(json!({"data": 1})));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_miss_is_counted() {
        let cache = WorkflowCache::default();
        assert!(cache.get("missing", None).is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hit_rate(), 0.0);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = WorkflowCache::default();
        cache.set_with_ttl("short", json!(1), Some(Duration::from_millis(10)), None);
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("short", None).is_none());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let cache = WorkflowCache::new(Duration::ZERO);
        cache.set("forever", json!(true), None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("forever", None), Some(json!(true)));
    }

    #[test]
    fn test_file_change_invalidates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.json");
        fs::write(&path, r#"{"version": 1}"#).unwrap();

        let cache = WorkflowCache::default();
        cache.set("doc", json!({"version": 1}), Some(&path));
        assert!(cache.get("doc", Some(&path)).is_some());

        fs::write(&path, r#"{"version": 2}"#).unwrap();
        assert!(cache.get("doc", Some(&path)).is_none());
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = WorkflowCache::default();
        cache.set("topic_state:a", json!(1), None);
        cache.set("topic_state:b", json!(2), None);
        cache.set("settings", json!(3), None);

        cache.invalidate_prefix("topic_state:");

        assert!(cache.get("topic_state:a", None).is_none());
        assert!(cache.get("topic_state:b", None).is_none());
        assert!(cache.get("settings", None).is_some());
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = WorkflowCache::default();
        cache.disable();
        cache.set("key", json!(1), None);
        assert!(cache.get("key", None).is_none());

        cache.enable();
        assert!(cache.get("key", None).is_none());
        cache.set("key", json!(1), None);
        assert!(cache.get("key", None).is_some());
    }
}
