//! Read-through and cache-aside stages with optional LRU and TTL bounds.
//!
//! Recency is refreshed both by `set` and by a `get` that hits: a lookup
//! that serves a request counts as a use, so eviction removes the key that
//! was neither served nor refreshed for longest. A `get` that misses or
//! expires leaves the order of the remaining keys untouched.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use serde::Serialize;

use super::upstream;
use crate::clock::{Clock, Tick};
use crate::error::WorkError;
use crate::event::Event;
use crate::stage::Stage;
use crate::stats::CacheStats;

// ============================================================================
// Store
// ============================================================================

/// Key → tick of last refresh, with recency order.
///
/// `order` holds exactly the keys of `entries`, least recently used first.
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    entries: HashMap<String, Tick>,
    order: VecDeque<String>,
    capacity: Option<usize>,
    ttl: Option<Tick>,
    stats: CacheStats,
}

impl CacheStore {
    /// A store with no size bound and no expiry.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A store bounded by `capacity` entries and/or `ttl` ticks.
    pub fn bounded(capacity: Option<usize>, ttl: Option<Tick>) -> Self {
        debug_assert!(capacity != Some(0), "cache capacity must be positive");
        Self {
            capacity,
            ttl,
            ..Self::default()
        }
    }

    /// Looks up `key`, returning its last refresh tick.
    ///
    /// Expired entries are removed. A hit becomes most recently used.
    pub fn get(&mut self, key: &str, now: Tick) -> Option<Tick> {
        let Some(refreshed) = self.entries.get(key).copied() else {
            self.stats.misses += 1;
            return None;
        };

        if self.is_expired(refreshed, now) {
            self.remove(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            tracing::trace!(key, age = now - refreshed, "cache entry expired");
            return None;
        }

        self.touch(key);
        self.stats.hits += 1;
        Some(refreshed)
    }

    /// Looks up `key` without touching recency, expiry or stats.
    pub fn peek(&self, key: &str) -> Option<Tick> {
        self.entries.get(key).copied()
    }

    /// Records `key` as refreshed at `now`, evicting the least recently used
    /// entries beyond capacity.
    pub fn set(&mut self, key: &str, now: Tick) {
        if self.entries.insert(key.to_string(), now).is_some() {
            self.touch(key);
        } else {
            self.order.push_back(key.to_string());
        }

        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
                self.stats.evictions += 1;
                tracing::trace!(key = %oldest, "cache entry evicted");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Entries that would still hit at `now`, and their average age.
    pub fn snapshot(&self, now: Tick) -> CacheSnapshot {
        let live: Vec<Tick> = self
            .entries
            .values()
            .copied()
            .filter(|refreshed| !self.is_expired(*refreshed, now))
            .map(|refreshed| now - refreshed)
            .collect();
        let average_age = if live.is_empty() {
            0.0
        } else {
            live.iter().sum::<Tick>() as f64 / live.len() as f64
        };
        CacheSnapshot {
            live_keys: live.len(),
            average_age,
        }
    }

    fn is_expired(&self, refreshed: Tick, now: Tick) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_sub(refreshed) >= ttl)
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

/// Point-in-time view of a cache's contents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub live_keys: usize,
    pub average_age: f64,
}

// ============================================================================
// Stage policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Miss ⇒ call the inner stage and store the key on success.
    ReadThrough,
    /// Always refresh from the inner stage in the background; answer from
    /// the cache alone.
    Aside,
}

/// Caching policy in front of an inner stage.
#[derive(Debug)]
pub struct Cache {
    inner: Rc<Stage>,
    store: Rc<RefCell<CacheStore>>,
    mode: CacheMode,
}

impl Cache {
    /// Unbounded read-through cache.
    pub fn new(inner: Rc<Stage>) -> Self {
        Self::with_store(inner, CacheStore::unbounded(), CacheMode::ReadThrough)
    }

    /// Read-through cache with LRU eviction and TTL expiry.
    pub fn lru(inner: Rc<Stage>, capacity: Option<usize>, ttl: Option<Tick>) -> Self {
        Self::with_store(
            inner,
            CacheStore::bounded(capacity, ttl),
            CacheMode::ReadThrough,
        )
    }

    /// Cache-aside: never waits for the inner stage.
    pub fn aside(inner: Rc<Stage>, capacity: Option<usize>, ttl: Option<Tick>) -> Self {
        Self::with_store(inner, CacheStore::bounded(capacity, ttl), CacheMode::Aside)
    }

    pub fn with_store(inner: Rc<Stage>, store: CacheStore, mode: CacheMode) -> Self {
        Self {
            inner,
            store: Rc::new(RefCell::new(store)),
            mode,
        }
    }

    pub fn kind(&self) -> &'static str {
        let store = self.store.borrow();
        match self.mode {
            CacheMode::Aside => "aside-cache",
            CacheMode::ReadThrough if store.capacity.is_some() || store.ttl.is_some() => {
                "lru-cache"
            }
            CacheMode::ReadThrough => "cache",
        }
    }

    pub fn inner(&self) -> &Rc<Stage> {
        &self.inner
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn store(&self) -> std::cell::Ref<'_, CacheStore> {
        self.store.borrow()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.borrow().stats()
    }

    pub fn snapshot(&self, now: Tick) -> CacheSnapshot {
        self.store.borrow().snapshot(now)
    }

    pub(crate) async fn work(&self, clock: &Clock, event: &Event) -> Result<(), WorkError> {
        let key = event.key();
        let hit = self.store.borrow_mut().get(key, clock.now()).is_some();

        match self.mode {
            CacheMode::ReadThrough => {
                if hit {
                    tracing::trace!(key, "cache hit");
                    return Ok(());
                }
                tracing::trace!(key, "cache miss");
                let response = self.inner.accept(event.clone()).await;
                if response.is_success() {
                    self.store.borrow_mut().set(key, clock.now());
                }
                upstream(response)
            }
            CacheMode::Aside => {
                let refresh = self.inner.accept(event.clone());
                let store = Rc::clone(&self.store);
                let c = clock.clone();
                let key_owned = key.to_string();
                drop(clock.spawn(async move {
                    if refresh.await.is_success() {
                        store.borrow_mut().set(&key_owned, c.now());
                    }
                }));
                if hit { Ok(()) } else { Err(WorkError::CacheMiss) }
            }
        }
    }
}
