//! Tiered cache with LRU eviction and single-flight loading
//!
//! The cache sits in front of the adapters. A hit never touches an adapter;
//! a miss runs the loader once per key no matter how many callers are
//! waiting, and every waiter receives the same value or the same error.

use crate::error::{MemoryError, MemoryResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type LoadFuture<V> = Shared<BoxFuture<'static, Result<V, Arc<MemoryError>>>>;

/// Cached value plus access bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub last_access_time: DateTime<Utc>,
    pub access_count: u64,
    stamp: u64,
}

struct Flight<V: Clone> {
    future: LoadFuture<V>,
    /// Set when a put or invalidate overtakes the load
    stale: Arc<AtomicBool>,
}

impl<V: Clone> Clone for Flight<V> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
            stale: self.stale.clone(),
        }
    }
}

struct LruState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Recency order: lowest stamp is least recently used
    order: BTreeMap<u64, String>,
    tick: u64,
}

impl<V: Clone> LruState<V> {
    fn touch(&mut self, key: &str) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.stamp);
        entry.stamp = tick;
        entry.access_count += 1;
        entry.last_access_time = Utc::now();
        self.order.insert(tick, key.to_string());
        Some(entry.value.clone())
    }

    /// Insert or replace; returns evicted keys
    fn insert(&mut self, key: &str, value: V, capacity: usize) -> Vec<String> {
        if capacity == 0 {
            return Vec::new();
        }
        self.tick += 1;
        let tick = self.tick;

        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.stamp);
            entry.value = value;
            entry.stamp = tick;
            entry.access_count += 1;
            entry.last_access_time = Utc::now();
            self.order.insert(tick, key.to_string());
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while self.entries.len() >= capacity {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                    evicted.push(oldest);
                }
                None => break,
            }
        }

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                last_access_time: Utc::now(),
                access_count: 1,
                stamp: tick,
            },
        );
        self.order.insert(tick, key.to_string());
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.stamp);
                true
            }
            None => false,
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
}

/// Bounded LRU cache shared by every caller of a manager
pub struct TieredCache<V: Clone + Send + Sync + 'static> {
    capacity: usize,
    state: Mutex<LruState<V>>,
    inflight: DashMap<String, Flight<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> TieredCache<V> {
    /// Create a cache; capacity 0 disables storage but keeps single-flight
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
            }),
            inflight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Maximum number of entries; 0 disables caching
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached value, marking it most recently used
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.state.lock().touch(key);
        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Cached value or the result of `loader`, run at most once per key
    /// across concurrent callers
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> MemoryResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MemoryResult<V>> + Send + 'static,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let flight = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                // A load may have finished between the miss and taking the slot
                if let Some(value) = self.state.lock().touch(key) {
                    return Ok(value);
                }
                self.loads.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache_key = %key, "cache load");
                let flight = Flight {
                    future: loader().map(|r| r.map_err(Arc::new)).boxed().shared(),
                    stale: Arc::new(AtomicBool::new(false)),
                };
                slot.insert(flight.clone());
                flight
            }
        };

        let result = flight.future.clone().await;

        let finished = self
            .inflight
            .remove_if(key, |_, current| Arc::ptr_eq(&current.stale, &flight.stale));
        if finished.is_some() && !flight.stale.load(Ordering::Acquire) {
            if let Ok(value) = &result {
                self.insert(key, value.clone());
            }
        }

        result.map_err(|source| MemoryError::CacheLoad {
            key: key.to_string(),
            source,
        })
    }

    /// Write-through: replace the entry and mark it most recently used
    pub fn put(&self, key: &str, value: V) {
        self.abandon_flight(key);
        self.insert(key, value);
    }

    /// Drop an entry if present
    pub fn invalidate(&self, key: &str) {
        self.abandon_flight(key);
        if self.state.lock().remove(key) {
            tracing::debug!(cache_key = %key, "cache invalidated");
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Entry bookkeeping without touching recency
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit, miss and eviction counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn insert(&self, key: &str, value: V) {
        let evicted = self.state.lock().insert(key, value, self.capacity);
        if !evicted.is_empty() {
            self.evictions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            tracing::debug!(cache_key = %key, evicted = ?evicted, "lru eviction");
        }
    }

    fn abandon_flight(&self, key: &str) {
        if let Some((_, flight)) = self.inflight.remove(key) {
            flight.stale.store(true, Ordering::Release);
        }
    }
}

/// Cache key for a specific version
pub fn versioned_key(id: &str, version: u64) -> String {
    format!("{id}@v{version}")
}
