//! Per-process bounded TTL cache.
//!
//! Entries expire lazily: an expired entry is dropped when it is read, and all
//! expired entries are purged on every write. When a write pushes the cache
//! over capacity, the least recently touched entries are evicted first.
//!
//! The cache is advisory. A poisoned lock is treated as a miss and writes are
//! skipped, so callers always fall through to the uncached path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wattgate_core::{SharedClock, SystemClock};

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    expires_at_ms: i64,
    last_access_ms: i64,
    /// Monotonic touch counter; breaks ties between same-millisecond accesses.
    touched: u64,
}

#[derive(Debug)]
struct Inner<K, V> {
    entries: HashMap<K, CachedEntry<V>>,
    next_touch: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Bounded key → value cache with a default TTL.
///
/// Cloning is cheap and clones share the same storage.
#[derive(Clone)]
pub struct BoundedCache<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    counters: Arc<Counters>,
    max_entries: usize,
    ttl: Duration,
    clock: SharedClock,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self::with_clock(max_entries, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(max_entries: usize, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                next_touch: 0,
            })),
            counters: Arc::new(Counters::default()),
            max_entries: max_entries.max(1),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Look up `key`. Expired entries are removed and reported as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();
        let Ok(mut inner) = self.inner.lock() else {
            tracing::warn!("cache lock poisoned, treating lookup as a miss");
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let expired = match inner.entries.get(key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.expires_at_ms <= now,
        };

        if expired {
            inner.entries.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let touch = inner.next_touch;
        inner.next_touch += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.last_access_ms = now;
        entry.touched = touch;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Store `value` under the default TTL.
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    /// Store `value` with an explicit TTL.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = self.clock.now_millis();
        let Ok(mut inner) = self.inner.lock() else {
            tracing::warn!("cache lock poisoned, skipping write");
            return;
        };

        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.expires_at_ms > now);
        let purged = (before - inner.entries.len()) as u64;
        if purged > 0 {
            self.counters.expirations.fetch_add(purged, Ordering::Relaxed);
        }

        let touch = inner.next_touch;
        inner.next_touch += 1;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        inner.entries.insert(
            key,
            CachedEntry {
                value,
                expires_at_ms: now.saturating_add(ttl_ms),
                last_access_ms: now,
                touched: touch,
            },
        );

        while inner.entries.len() > self.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.last_access_ms, entry.touched))
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    inner.entries.remove(&k);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().ok()?;
        inner.entries.remove(key).map(|entry| entry.value)
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }
}

impl<K, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use wattgate_core::ManualClock;

    fn cache(max: usize, ttl_ms: u64) -> (BoundedCache<String, u32>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = BoundedCache::with_clock(max, Duration::from_millis(ttl_ms), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_get_before_and_after_ttl() {
        let (cache, clock) = cache(10, 1_000);
        cache.set("a".to_string(), 1);
        clock.advance(Duration::from_millis(999));
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.len(), 0, "expired entry is removed on read");
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let (cache, clock) = cache(2, 60_000);
        cache.set("a".to_string(), 1);
        clock.advance(Duration::from_millis(10));
        cache.set("b".to_string(), 2);
        clock.advance(Duration::from_millis(10));
        // Touch "a" so "b" becomes the oldest.
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.set("c".to_string(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b".to_string()), None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"c".to_string()), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_same_millisecond_writes_evict_in_insertion_order() {
        let (cache, _clock) = cache(2, 60_000);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        cache.set("c".to_string(), 3);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get(&"b".to_string()), Some(2));
    }

    #[test]
    fn test_write_purges_expired_entries() {
        let (cache, clock) = cache(10, 100);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        clock.advance(Duration::from_millis(200));
        cache.set("c".to_string(), 3);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 2);
    }

    #[test]
    fn test_explicit_ttl_overrides_default() {
        let (cache, clock) = cache(10, 100);
        cache.set_with_ttl("long".to_string(), 7, Duration::from_secs(10));
        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.get(&"long".to_string()), Some(7));
    }

    #[test]
    fn test_stats_hit_rate() {
        let (cache, _clock) = cache(10, 1_000);
        cache.set("a".to_string(), 1);
        cache.get(&"a".to_string());
        cache.get(&"missing".to_string());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn prop_value_visible_until_ttl(ttl_ms in 1u64..100_000, elapsed in 0u64..200_000, value: u32) {
            let (cache, clock) = cache(8, ttl_ms);
            cache.set("k".to_string(), value);
            clock.advance(Duration::from_millis(elapsed));
            let got = cache.get(&"k".to_string());
            if elapsed < ttl_ms {
                prop_assert_eq!(got, Some(value));
            } else {
                prop_assert_eq!(got, None);
            }
        }

        #[test]
        fn prop_never_exceeds_capacity(max in 1usize..16, keys in proptest::collection::vec(0u8..64, 0..128)) {
            let (cache, _clock) = cache(max, 60_000);
            for k in keys {
                cache.set(k.to_string(), k as u32);
                prop_assert!(cache.len() <= max);
            }
        }
    }
}
