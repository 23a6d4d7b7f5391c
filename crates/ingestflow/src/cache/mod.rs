//! Capacity- and memory-bounded resource cache with TTL expiry
//!
//! Caches expensive computation results (embeddings, extracted text) keyed by
//! content hash. Eviction removes the lowest-access-count entry; memory is
//! estimated structurally, which only needs to order entries consistently.

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

/// Fixed bookkeeping cost charged per entry on top of the value weight
const ENTRY_OVERHEAD_BYTES: usize = 96;

/// Bytes charged per character of cached string content
const BYTES_PER_CHAR: usize = 2;

/// Structural memory estimate for cached values.
///
/// Estimates only need monotonic ordering for eviction decisions, not
/// byte-exact accounting.
pub trait EntryWeight {
    /// Estimated size of this value in bytes
    fn weight(&self) -> usize;
}

impl EntryWeight for String {
    fn weight(&self) -> usize {
        self.len() * BYTES_PER_CHAR
    }
}

impl EntryWeight for f32 {
    fn weight(&self) -> usize {
        4
    }
}

impl EntryWeight for u8 {
    fn weight(&self) -> usize {
        1
    }
}

impl<T: EntryWeight> EntryWeight for Vec<T> {
    fn weight(&self) -> usize {
        self.iter().map(EntryWeight::weight).sum::<usize>() + std::mem::size_of::<Self>()
    }
}

impl<T: EntryWeight> EntryWeight for Option<T> {
    fn weight(&self) -> usize {
        self.as_ref().map(EntryWeight::weight).unwrap_or(0)
    }
}

impl EntryWeight for serde_json::Value {
    fn weight(&self) -> usize {
        match self {
            serde_json::Value::Null | serde_json::Value::Bool(_) => 8,
            serde_json::Value::Number(_) => 16,
            serde_json::Value::String(s) => s.len() * BYTES_PER_CHAR,
            serde_json::Value::Array(items) => {
                items.iter().map(EntryWeight::weight).sum::<usize>() + 16
            }
            serde_json::Value::Object(map) => {
                map.iter()
                    .map(|(k, v)| k.len() * BYTES_PER_CHAR + v.weight())
                    .sum::<usize>()
                    + 16
            }
        }
    }
}

/// Hash content into a hex cache key
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    access_count: u64,
    weight: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    memory_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

/// Capacity- and memory-bounded cache with TTL expiry and frequency-based
/// eviction. A single process-wide instance is shared per resource kind.
pub struct ResourceCache<V> {
    inner: RwLock<CacheInner<V>>,
    max_entries: usize,
    max_memory_bytes: usize,
    default_ttl: Duration,
}

impl<V: Clone + EntryWeight> ResourceCache<V> {
    /// Create a cache from configuration
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_limits(config.max_entries, config.max_memory_bytes, config.ttl())
    }

    /// Create a cache with explicit limits
    pub fn with_limits(max_entries: usize, max_memory_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                memory_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expired: 0,
            }),
            max_entries: max_entries.max(1),
            max_memory_bytes,
            default_ttl,
        }
    }

    /// Get a value if present and not expired.
    ///
    /// Expired entries are removed on access and count as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let inner = &mut *self.inner.write();

        match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                inner.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => {}
            None => {
                inner.misses += 1;
                return None;
            }
        }

        // Present but expired: drop the stale entry and report a miss
        if let Some(entry) = inner.entries.remove(key) {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.weight);
            inner.expired += 1;
        }
        inner.misses += 1;
        None
    }

    /// Insert a value with the default TTL
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl)
    }

    /// Insert a value with an explicit TTL.
    ///
    /// When at capacity, the entry with the lowest access count is evicted
    /// first; after insertion, eviction repeats until the estimated memory is
    /// within budget.
    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let weight = value.weight() + ENTRY_OVERHEAD_BYTES;
        let mut inner = self.inner.write();

        // Replacing an existing key frees its weight first
        if let Some(old) = inner.entries.remove(&key) {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(old.weight);
        }

        if inner.entries.len() >= self.max_entries {
            Self::evict_coldest(&mut inner);
        }

        inner.memory_bytes += weight;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
                access_count: 1,
                weight,
            },
        );

        while inner.memory_bytes > self.max_memory_bytes && !inner.entries.is_empty() {
            Self::evict_coldest(&mut inner);
        }
    }

    /// Remove a single entry
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.write();
        inner.entries.remove(key).map(|entry| {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.weight);
            entry.value
        })
    }

    /// Drop all entries
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.memory_bytes = 0;
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Snapshot of cache statistics
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let total = inner.hits + inner.misses;
        CacheStats {
            entries: inner.entries.len(),
            memory_bytes: inner.memory_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expired: inner.expired,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64
            } else {
                0.0
            },
            max_entries: self.max_entries,
            max_memory_bytes: self.max_memory_bytes,
        }
    }

    /// Evict the entry with the lowest access count (ties broken arbitrarily)
    fn evict_coldest(inner: &mut CacheInner<V>) {
        let coldest = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.access_count)
            .map(|(k, _)| k.clone());

        if let Some(key) = coldest {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.weight);
                inner.evictions += 1;
                tracing::debug!("Evicted cache entry {} (weight {} bytes)", &key[..key.len().min(12)], entry.weight);
            }
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub hit_rate: f64,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> ResourceCache<String> {
        ResourceCache::with_limits(2, 1024 * 1024, Duration::from_secs(60))
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = small_cache();
        cache.insert("a", "alpha".to_string());
        assert_eq!(cache.get("a"), Some("alpha".to_string()));
        assert_eq!(cache.get("b"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_capacity_evicts_lowest_access_count() {
        let cache = small_cache();
        cache.insert("a", "alpha".to_string());
        cache.insert("b", "beta".to_string());

        // Access A twice so its count is 3 (insert counts as 1)
        cache.get("a");
        cache.get("a");

        // Inserting C at capacity evicts B, the coldest entry
        cache.insert("c", "gamma".to_string());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_ttl_expiry_is_a_miss() {
        let cache = ResourceCache::with_limits(10, 1024 * 1024, Duration::from_secs(60));
        cache.insert_with_ttl("a", "alpha".to_string(), Duration::from_millis(0));
        assert_eq!(cache.get("a"), None);

        let stats = cache.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_memory_budget_holds_after_insert() {
        // Budget fits roughly two small strings plus overhead
        let cache: ResourceCache<String> =
            ResourceCache::with_limits(100, 300, Duration::from_secs(60));
        for i in 0..20 {
            cache.insert(format!("key-{}", i), "x".repeat(20));
            assert!(cache.stats().memory_bytes <= 300);
        }
        assert!(cache.len() < 20);
    }

    #[test]
    fn test_replace_does_not_leak_weight() {
        let cache: ResourceCache<String> =
            ResourceCache::with_limits(10, 1024 * 1024, Duration::from_secs(60));
        cache.insert("a", "x".repeat(100));
        let first = cache.stats().memory_bytes;
        cache.insert("a", "x".repeat(100));
        assert_eq!(cache.stats().memory_bytes, first);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_vector_weight_orders_by_length() {
        let short = vec![0.0f32; 8];
        let long = vec![0.0f32; 768];
        assert!(long.weight() > short.weight());
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("hello "));
    }
}
