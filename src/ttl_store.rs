//! TTL Store - Bounded In-Memory Store with Per-Entry Expiration
//!
//! A thread-safe `String -> V` map. Every entry carries the instant it was
//! stored and its TTL; an entry is visible only while `now < stored_at + ttl`.
//! Expired entries are dropped lazily on read and eagerly by
//! [`TtlStore::purge_expired`].
//!
//! The store never holds more than `capacity` entries. Inserting a new key
//! into a full store evicts exactly one entry first, chosen by the
//! [`EvictionPolicy`]: least recently used, or least recently inserted.
//!
//! Each store has its own lock, so two stores never contend.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::{EvictionPolicy, StoreConfig};

/// Cache entry with TTL information
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
    /// Position in the eviction order
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= self.ttl
    }
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// tick -> key, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl<V> Inner<V> {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Point-in-time counters for one store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    pub sets: u64,
    pub size: usize,
    pub capacity: usize,
}

impl StoreStats {
    /// Hits as a percentage of lookups
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            (self.hits as f64 / lookups as f64) * 100.0
        }
    }
}

/// Bounded TTL store shared between workers
#[derive(Debug)]
pub struct TtlStore<V> {
    name: String,
    ttl: Duration,
    capacity: usize,
    eviction: EvictionPolicy,
    inner: Mutex<Inner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    sets: AtomicU64,
}

impl<V: Clone> TtlStore<V> {
    /// Create a store. A zero capacity is raised to one.
    pub fn new(name: impl Into<String>, ttl: Duration, capacity: usize) -> Self {
        Self::with_policy(name, ttl, capacity, EvictionPolicy::Lru)
    }

    pub fn with_policy(
        name: impl Into<String>,
        ttl: Duration,
        capacity: usize,
        eviction: EvictionPolicy,
    ) -> Self {
        let name = name.into();
        let capacity = capacity.max(1);
        info!(store = %name, ttl_secs = ttl.as_secs(), capacity, ?eviction, "Initializing TTL store");

        Self {
            name,
            ttl,
            capacity,
            eviction,
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity.min(1024)),
                order: BTreeMap::new(),
                next_tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &StoreConfig) -> Self {
        Self::with_policy(name, config.ttl(), config.capacity, config.eviction)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Value for `key` if present and unexpired
    ///
    /// A key that was never set and a key whose TTL elapsed both report
    /// `None`.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.entries.get(key).map(|entry| entry.is_expired(now)) {
            None => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(store = %self.name, key = %key, "Cache miss");
                return None;
            }
            Some(true) => {
                inner.remove(key);
                drop(inner);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(store = %self.name, key = %key, "Cache miss (expired)");
                return None;
            }
            Some(false) => {}
        }

        let touch = match self.eviction {
            EvictionPolicy::Lru => Some(inner.bump()),
            EvictionPolicy::Fifo => None,
        };
        let Inner { entries, order, .. } = &mut *inner;
        let entry = entries.get_mut(key)?;
        if let Some(tick) = touch {
            order.remove(&entry.tick);
            order.insert(tick, key.to_string());
            entry.tick = tick;
        }
        let value = entry.value.clone();
        drop(inner);

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(store = %self.name, key = %key, "Cache hit");
        Some(value)
    }

    /// Value for `key` without counting a lookup or refreshing recency
    ///
    /// For re-checks by a caller whose miss was already counted. Expired
    /// entries report `None` and are left for the next read or purge.
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Insert or overwrite with the store's TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    /// Insert or overwrite with an explicit TTL
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.lock();

        let mut evicted = None;
        if inner.remove(&key).is_none() && inner.entries.len() >= self.capacity {
            evicted = inner.evict_oldest();
        }

        let tick = inner.bump();
        inner.order.insert(tick, key.clone());
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
                tick,
            },
        );
        drop(inner);

        self.sets.fetch_add(1, Ordering::Relaxed);
        if let Some(evicted) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(store = %self.name, evicted = %evicted, "Evicted entry at capacity");
        }
        debug!(store = %self.name, key = %key, ttl_ms = ttl.as_millis(), "Cached key with TTL");
    }

    /// Remove one entry; returns whether it existed
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            debug!(store = %self.name, key = %key, "Invalidated key");
        }
        removed
    }

    /// Remove every entry whose key satisfies `predicate`
    pub fn invalidate_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let mut inner = self.inner.lock();
        let Inner { entries, order, .. } = &mut *inner;

        let before = entries.len();
        entries.retain(|key, entry| {
            if predicate(key) {
                order.remove(&entry.tick);
                false
            } else {
                true
            }
        });
        let removed = before - entries.len();
        drop(inner);

        debug!(store = %self.name, count = removed, "Invalidated matching keys");
        removed
    }

    /// Remove all entries
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        drop(inner);

        info!(store = %self.name, count = removed, "Cleared store");
        removed
    }

    /// Drop every expired entry now instead of waiting for a read
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Inner { entries, order, .. } = &mut *inner;

        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.is_expired(now) {
                order.remove(&entry.tick);
                false
            } else {
                true
            }
        });
        let removed = before - entries.len();
        drop(inner);

        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(store = %self.name, count = removed, "Purged expired entries");
        }
        removed
    }

    /// Write, read back and remove a scratch entry in one lock hold
    ///
    /// Nothing else is disturbed: counters, eviction order and the stored
    /// entries stay as they were. A full store, or one already holding
    /// `key`, only shows that its lock can be taken.
    pub fn self_check(&self, key: &str, value: V) -> bool
    where
        V: PartialEq,
    {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.capacity || inner.entries.contains_key(key) {
            return true;
        }

        // Tick 0 is never issued, so the order map is not involved
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                stored_at: Instant::now(),
                ttl: self.ttl,
                tick: 0,
            },
        );
        let ok = inner.entries.get(key).is_some_and(|entry| entry.value == value);
        inner.entries.remove(key);
        ok
    }

    /// Number of stored entries, expired-but-unpurged ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }

    /// Zero all counters; entries are untouched
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread::sleep;

    fn store(capacity: usize) -> TtlStore<String> {
        TtlStore::new("test", Duration::from_secs(300), capacity)
    }

    #[test]
    fn test_set_and_get() {
        let store = store(10);
        store.set("key1", "value1".to_string());

        assert_eq!(store.get("key1").as_deref(), Some("value1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = store(10);
        assert_eq!(store.get("nope"), None);
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let store = store(10);
        store.set("key1", "a".to_string());
        store.set("key1", "b".to_string());

        assert_eq!(store.get("key1").as_deref(), Some("b"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().evictions, 0);
    }

    #[test]
    fn test_expired_entry_behaves_as_absent() {
        let store = store(10);
        store.set_with_ttl("short", "v".to_string(), Duration::from_millis(50));
        store.set("long", "v".to_string());

        assert!(store.get("short").is_some());
        sleep(Duration::from_millis(80));

        assert_eq!(store.get("short"), None);
        assert!(store.get("long").is_some());
        let stats = store.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let store = store(3);
        store.set("key1", "1".to_string());
        store.set("key2", "2".to_string());
        store.set("key3", "3".to_string());

        // key1 becomes most recently used, so key2 is now the oldest
        assert!(store.get("key1").is_some());
        store.set("key4", "4".to_string());

        assert_eq!(store.len(), 3);
        assert!(store.get("key1").is_some());
        assert_eq!(store.get("key2"), None);
        assert!(store.get("key3").is_some());
        assert!(store.get("key4").is_some());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_fifo_ignores_reads() {
        let store: TtlStore<String> =
            TtlStore::with_policy("fifo", Duration::from_secs(60), 2, EvictionPolicy::Fifo);
        store.set("a", "1".to_string());
        store.set("b", "2".to_string());
        assert!(store.get("a").is_some());

        store.set("c", "3".to_string());

        assert_eq!(store.get("a"), None);
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let store = store(7);
        for i in 0..100 {
            store.set(format!("key{i}"), i.to_string());
            assert!(store.len() <= 7);
        }
        assert_eq!(store.stats().evictions, 93);
        // The survivors are the seven most recent inserts
        for i in 93..100 {
            assert!(store.get(&format!("key{i}")).is_some());
        }
    }

    #[test]
    fn test_invalidate_and_matching() {
        let store = store(10);
        store.set("view:1:t1", "a".to_string());
        store.set("view:1:t2", "b".to_string());
        store.set("view:2:t3", "c".to_string());

        assert!(store.invalidate("view:2:t3"));
        assert!(!store.invalidate("view:2:t3"));

        store.set("view:2:t3", "c".to_string());
        let removed = store.invalidate_matching(|k| k.starts_with("view:1:"));
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("view:2:t3").is_some());
    }

    #[test]
    fn test_invalidated_key_leaves_no_stale_order() {
        let store = store(2);
        store.set("a", "1".to_string());
        store.set("b", "2".to_string());
        store.invalidate("a");
        store.set("c", "3".to_string());

        // Room was freed by the invalidation; nothing should be evicted
        assert_eq!(store.stats().evictions, 0);
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn test_clear_and_purge() {
        let store = store(10);
        store.set_with_ttl("old", "1".to_string(), Duration::from_millis(20));
        store.set("new", "2".to_string());
        sleep(Duration::from_millis(40));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_stats_and_reset() {
        let store = store(10);
        store.set("k", "v".to_string());
        store.get("k");
        store.get("k");
        store.get("missing");

        let stats = store.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_rate() - 66.666).abs() < 0.1);

        store.reset_stats();
        let stats = store.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_peek_counts_nothing() {
        let store = store(2);
        store.set("a", "1".to_string());
        store.set("b", "2".to_string());

        assert_eq!(store.peek("a").as_deref(), Some("1"));
        assert_eq!(store.peek("zzz"), None);
        let stats = store.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));

        // Peeking did not make "a" recently used
        store.set("c", "3".to_string());
        assert_eq!(store.peek("a"), None);
        assert!(store.peek("b").is_some());
    }

    #[test]
    fn test_self_check_leaves_entries_and_counters() {
        let roomy = store(4);
        roomy.set("a", "1".to_string());
        assert!(roomy.self_check("__check__", "ok".to_string()));
        assert_eq!(roomy.len(), 1);
        assert_eq!(roomy.peek("__check__"), None);

        let full = store(2);
        full.set("a", "1".to_string());
        full.set("b", "2".to_string());
        assert!(full.self_check("__check__", "ok".to_string()));
        assert!(full.peek("a").is_some());
        assert!(full.peek("b").is_some());

        for stats in [roomy.stats(), full.stats()] {
            assert_eq!((stats.hits, stats.misses, stats.evictions), (0, 0, 0));
        }
        assert_eq!(full.stats().sets, 2);
    }

    #[test]
    fn test_concurrent_writers_respect_capacity() {
        let store = Arc::new(store(50));

        std::thread::scope(|scope| {
            for t in 0..8 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for i in 0..500 {
                        let key = format!("t{t}:k{}", i % 80);
                        store.set(key.clone(), i.to_string());
                        store.get(&key);
                        if i % 17 == 0 {
                            store.invalidate_matching(|k| k.ends_with(":k0"));
                        }
                    }
                });
            }
        });

        assert!(store.len() <= 50);
    }
}
