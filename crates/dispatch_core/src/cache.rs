//! Cache (C3): TTL key/value store with prefix invalidation and hit/miss
//! counters.
//!
//! The teacher caches with `lru::LruCache` (size-based eviction, see the old
//! `spatial.rs` distance cache); this cache needs time-based expiry and
//! prefix deletes instead, so entries live in a `dashmap::DashMap` (the
//! concurrent map already in the pack's dependency tree, via
//! `seanchatmangpt-knhk`) keyed by the full string key, each carrying its own
//! expiry instant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Snapshot of cache hit/miss counters (spec §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// TTL cache storing JSON-serialized values as strings; callers serialize/
/// deserialize at the edges, matching the pattern/prefix-invalidation
/// contract of spec §4.3 (which is key-shaped, not type-shaped).
pub struct Cache {
    entries: DashMap<String, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self { entries: DashMap::new(), hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.entries.insert(
            key.into(),
            Entry { value: value.into(), expires_at: Instant::now() + ttl },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let live = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone());

        match live {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn delete_by_prefix(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    /// Drop all expired entries. Called by the background sweep loop every
    /// 60 s, per spec §4.3.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn get_returns_none_after_ttl_expires() {
        let cache = Cache::new();
        cache.set("k", "v", Duration::from_millis(10));
        assert_eq!(cache.get("k"), Some("v".to_string()));
        sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn delete_by_prefix_removes_matching_keys_only() {
        let cache = Cache::new();
        cache.set("vehicle:1", "a", Duration::from_secs(60));
        cache.set("vehicle:2", "b", Duration::from_secs(60));
        cache.set("fault:1", "c", Duration::from_secs(60));

        cache.delete_by_prefix("vehicle:");

        assert_eq!(cache.get("vehicle:1"), None);
        assert_eq!(cache.get("vehicle:2"), None);
        assert_eq!(cache.get("fault:1"), Some("c".to_string()));
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = Cache::new();
        cache.set("k", "v", Duration::from_secs(60));
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
