use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

use crate::error::SourceResult;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub last_update: Option<DateTime<Utc>>,
    pub last_result: Option<V>,
}

impl<V> Default for CacheEntry<V> {
    fn default() -> Self {
        Self {
            last_update: None,
            last_result: None,
        }
    }
}

/// Last successful response per key, gated by a freshness window
///
/// A failed fetch never touches the cache, so the entry simply stays stale
/// until the next successful refresh.
#[derive(Debug)]
pub struct ResponseCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
}

impl<K, V> Default for ResponseCache<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ResponseCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `key` has never been fetched or `now - last_update >= window`
    pub fn should_refresh(&mut self, key: &K, window: Duration, now: DateTime<Utc>) -> bool {
        let entry = self.entries.entry(key.clone()).or_default();
        match entry.last_update {
            Some(last) => now - last >= window,
            None => true,
        }
    }

    /// Cached value if still inside the freshness window
    pub fn fresh(&mut self, key: &K, window: Duration, now: DateTime<Utc>) -> Option<V> {
        if self.should_refresh(key, window, now) {
            return None;
        }
        self.entries.get(key).and_then(|e| e.last_result.clone())
    }

    pub fn store(&mut self, key: K, value: V, now: DateTime<Utc>) {
        self.entries.insert(
            key,
            CacheEntry {
                last_update: Some(now),
                last_result: Some(value),
            },
        );
    }

    pub fn entry(&self, key: &K) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }
}

type SharedFetch<V> = Shared<BoxFuture<'static, SourceResult<V>>>;

/// Collapses concurrent requests for the same key onto one upstream call
pub struct SingleFlight<K, V> {
    in_flight: Mutex<HashMap<K, SharedFetch<V>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the in-flight call for `key`, starting one with `start` if
    /// none is running.
    pub async fn run<F>(&self, key: K, start: F) -> SourceResult<V>
    where
        F: FnOnce() -> BoxFuture<'static, SourceResult<V>>,
    {
        let fetch = {
            let mut in_flight = self.in_flight.lock();
            in_flight
                .entry(key.clone())
                .or_insert_with(|| start().shared())
                .clone()
        };

        let result = fetch.clone().await;

        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&key).map_or(false, |f| f.ptr_eq(&fetch)) {
            in_flight.remove(&key);
        }
        result
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}
