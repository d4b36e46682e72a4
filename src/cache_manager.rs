//! Cache Manager - Named TTL Stores in Front of the Ticket Source
//!
//! Owns one [`TtlStore`] per data category and offers get-or-populate on top.
//!
//! # Population guarantee
//!
//! By default two concurrent misses on the same key may both run their
//! populate function. The upstream fetch is an idempotent read, so the only
//! cost is a duplicate call. Setting `coalesce_population` serialises misses
//! per key: the first caller populates, later callers wait on a per-key lock
//! and then read the fresh entry.
//!
//! Each call counts exactly one store lookup. The re-check a waiter makes
//! after taking the per-key lock is not a lookup; when it finds a value it
//! is counted in [`ManagerStats::coalesced`].
//!
//! Failed populations are never cached. The error goes back to the caller
//! and the next call for that key runs the populate function again.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::EngineError;
use crate::ttl_store::{StoreStats, TtlStore};

/// RAII cleanup guard for in-flight population tracking
/// Ensures that entries are removed from `DashMap` even on early return or panic.
/// Held only by the caller that inserted the entry, and removes only that entry.
struct CleanupGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &self.lock));
    }
}

/// Data categories, one store each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Views,
    Tickets,
    Users,
}

impl StoreKind {
    pub const ALL: [StoreKind; 3] = [Self::Views, Self::Tickets, Self::Users];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Views => "views",
            Self::Tickets => "tickets",
            Self::Users => "users",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "views" => Ok(Self::Views),
            "tickets" => Ok(Self::Tickets),
            "users" => Ok(Self::Users),
            other => Err(EngineError::validation(format!("unknown cache store '{other}'"))),
        }
    }
}

/// Snapshot of every store plus manager-level counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStats {
    pub stores: BTreeMap<StoreKind, StoreStats>,
    /// Populate functions that ran to completion successfully
    pub populations: u64,
    /// Misses that were answered by another caller's population
    pub coalesced: u64,
    pub in_flight: usize,
}

impl ManagerStats {
    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.stores.values().map(|s| s.hits).sum()
    }

    #[must_use]
    pub fn total_misses(&self) -> u64 {
        self.stores.values().map(|s| s.misses).sum()
    }
}

/// Cache Manager - exclusive owner of the per-category stores
pub struct CacheManager {
    views: TtlStore<serde_json::Value>,
    tickets: TtlStore<serde_json::Value>,
    users: TtlStore<serde_json::Value>,
    coalesce_population: bool,
    /// In-flight populations, only used when coalescing
    in_flight_requests: DashMap<String, Arc<Mutex<()>>>,
    populations: AtomicU64,
    coalesced: AtomicU64,
}

impl CacheManager {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        info!(
            coalesce_population = config.coalesce_population,
            "Initializing Cache Manager"
        );

        Self {
            views: TtlStore::from_config(StoreKind::Views.as_str(), &config.views),
            tickets: TtlStore::from_config(StoreKind::Tickets.as_str(), &config.tickets),
            users: TtlStore::from_config(StoreKind::Users.as_str(), &config.users),
            coalesce_population: config.coalesce_population,
            in_flight_requests: DashMap::new(),
            populations: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Direct read access to one store
    #[must_use]
    pub fn store(&self, kind: StoreKind) -> &TtlStore<serde_json::Value> {
        match kind {
            StoreKind::Views => &self.views,
            StoreKind::Tickets => &self.tickets,
            StoreKind::Users => &self.users,
        }
    }

    pub fn get(&self, kind: StoreKind, key: &str) -> Option<serde_json::Value> {
        self.store(kind).get(key)
    }

    pub fn set(&self, kind: StoreKind, key: &str, value: serde_json::Value) {
        self.store(kind).set(key, value);
    }

    /// Cached value, or the result of `populate_fn` stored with the store's TTL
    ///
    /// On a hit `populate_fn` is not called. On a miss it is called once by
    /// this caller; an `Err` is returned untouched and nothing is cached.
    ///
    /// # Errors
    ///
    /// Whatever `populate_fn` returns.
    pub async fn get_or_populate<F, Fut, E>(
        &self,
        kind: StoreKind,
        key: &str,
        populate_fn: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<serde_json::Value, E>> + Send,
    {
        // Fast path: no locking beyond the store's own
        if let Some(value) = self.store(kind).get(key) {
            return Ok(value);
        }

        self.populate_on_miss(kind, key, populate_fn).await
    }

    /// Miss handling once the lookup has been counted
    async fn populate_on_miss<F, Fut, E>(
        &self,
        kind: StoreKind,
        key: &str,
        populate_fn: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<serde_json::Value, E>> + Send,
    {
        if !self.coalesce_population {
            return self.populate(kind, key, populate_fn).await;
        }

        let flight_key = format!("{kind}:{key}");
        let (lock, inserted) = match self.in_flight_requests.entry(flight_key.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let lock = Arc::new(Mutex::new(()));
                entry.insert(Arc::clone(&lock));
                (lock, true)
            }
        };

        // RAII cleanup guard - ensures entry is removed even on early return or panic
        let _cleanup_guard = inserted.then(|| CleanupGuard {
            map: &self.in_flight_requests,
            key: flight_key,
            lock: Arc::clone(&lock),
        });

        let _guard = lock.lock().await;

        // Another caller may have populated while we waited for the lock
        if let Some(value) = self.store(kind).peek(key) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(store = %kind, key = %key, "Miss answered by concurrent population");
            return Ok(value);
        }

        self.populate(kind, key, populate_fn).await
    }

    async fn populate<F, Fut, E>(
        &self,
        kind: StoreKind,
        key: &str,
        populate_fn: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<serde_json::Value, E>> + Send,
    {
        debug!(store = %kind, key = %key, "Populating cache from source");
        match populate_fn().await {
            Ok(value) => {
                self.store(kind).set(key, value.clone());
                self.populations.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(e) => {
                warn!(store = %kind, key = %key, "Cache population failed, nothing cached");
                Err(e)
            }
        }
    }

    /// Typed variant of [`get_or_populate`](Self::get_or_populate)
    ///
    /// Values are stored as JSON. A cached value that no longer decodes as
    /// `T` is dropped and repopulated.
    ///
    /// # Errors
    ///
    /// Whatever `populate_fn` returns, or a serialization error converted
    /// into `E`.
    pub async fn get_or_populate_typed<T, F, Fut, E>(
        &self,
        kind: StoreKind,
        key: &str,
        populate_fn: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: From<EngineError> + Send,
    {
        if let Some(cached) = self.store(kind).get(key) {
            match serde_json::from_value::<T>(cached) {
                Ok(typed) => return Ok(typed),
                Err(e) => {
                    warn!(store = %kind, key = %key, error = %e, "Cached value did not decode, repopulating");
                    self.store(kind).invalidate(key);
                }
            }
        }

        // The lookup above was the counted one
        let value = self
            .populate_on_miss(kind, key, || async move {
                let typed = populate_fn().await?;
                serde_json::to_value(&typed).map_err(|e| E::from(EngineError::from(e)))
            })
            .await?;

        serde_json::from_value(value).map_err(|e| E::from(EngineError::from(e)))
    }

    /// Drop one entry
    pub fn invalidate_entity(&self, kind: StoreKind, key: &str) -> bool {
        self.store(kind).invalidate(key)
    }

    /// Drop every entry whose key satisfies `predicate`
    pub fn invalidate_pattern<P>(&self, kind: StoreKind, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        self.store(kind).invalidate_matching(predicate)
    }

    /// Empty one store; for callers with independent evidence it is stale
    pub fn force_refresh(&self, kind: StoreKind) -> usize {
        info!(store = %kind, "Forcing cache refresh");
        self.store(kind).clear()
    }

    /// Empty every store
    pub fn clear_all(&self) -> usize {
        StoreKind::ALL.iter().map(|&kind| self.store(kind).clear()).sum()
    }

    /// Eagerly drop expired entries from every store
    pub fn purge_expired(&self) -> usize {
        StoreKind::ALL
            .iter()
            .map(|&kind| self.store(kind).purge_expired())
            .sum()
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> ManagerStats {
        ManagerStats {
            stores: StoreKind::ALL
                .iter()
                .map(|&kind| (kind, self.store(kind).stats()))
                .collect(),
            populations: self.populations.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            in_flight: self.in_flight_requests.len(),
        }
    }

    pub fn reset_stats(&self) {
        for kind in StoreKind::ALL {
            self.store(kind).reset_stats();
        }
        self.populations.store(0, Ordering::Relaxed);
        self.coalesced.store(0, Ordering::Relaxed);
    }

    /// Round-trip a scratch key through every store
    ///
    /// Stored entries and counters are left alone; see
    /// [`TtlStore::self_check`].
    #[must_use]
    pub fn health_check(&self) -> bool {
        let test_key = "__health_check__";
        let test_value = serde_json::json!({"test": true});

        StoreKind::ALL.iter().all(|&kind| {
            let ok = self.store(kind).self_check(test_key, test_value.clone());
            if !ok {
                warn!(store = %kind, "Cache health check failed");
            }
            ok
        })
    }
}
