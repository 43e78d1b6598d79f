//! Bounded key/value cache with pluggable eviction.
//!
//! [`EvictionCache`] holds at most `capacity` entries. When a new key would
//! exceed that bound, exactly one entry is evicted first, chosen by the
//! configured [`EvictionStrategy`]:
//!
//! - `lru`: the entry least recently read or written.
//! - `lfu`: the entry with the fewest recorded hits; ties go to the lowest key.
//! - `ttl`: the entry expiring first.
//!
//! Entries past their TTL are never returned. They are dropped lazily on read
//! and in bulk by the background sweeper started with
//! [`EvictionCache::spawn_sweeper`].
//!
//! ```
//! use std::time::Duration;
//! use hypersim::cache::{CacheConfig, EvictionCache, EvictionStrategy};
//!
//! let cache = EvictionCache::new(CacheConfig {
//!     capacity: 2,
//!     strategy: EvictionStrategy::Lru,
//!     ..CacheConfig::default()
//! });
//!
//! cache.set("a", 1);
//! cache.set("b", 2);
//! cache.get(&"a");
//! cache.set("c", 3);
//!
//! assert_eq!(cache.get(&"b"), None);
//! assert_eq!(cache.get(&"a"), Some(1));
//! ```

use std::{
    borrow::Borrow,
    collections::{BTreeMap, HashMap},
    hash::Hash,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::{task::JoinHandle, time::Instant};

/// Upper bound of expired entries removed per lock acquisition by the sweeper.
const SWEEP_BATCH: usize = 256;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    #[default]
    #[display("lru")]
    Lru,
    #[display("lfu")]
    Lfu,
    #[display("ttl")]
    Ttl,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub capacity: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_ttl: Duration,
    pub strategy: EvictionStrategy,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(300),
            strategy: EvictionStrategy::Lru,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to make room for new ones.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bookkeeping of a single entry, see [`EvictionCache::inspect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub hit_count: u64,
    pub expires_in: Duration,
    /// Time since the last read or write.
    pub idle: Duration,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
    hit_count: u64,
    last_accessed_at: Instant,
    // position in the recency index
    tick: u64,
}

#[derive(Debug)]
struct Inner<K, V> {
    config: CacheConfig,
    entries: HashMap<K, Entry<V>>,
    recency: BTreeMap<u64, K>,
    tick: u64,
    stats: CacheStats,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Ord + Clone,
{
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch<Q>(&mut self, key: &Q, now: Instant)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let tick = self.next_tick();
        if let Some((key, entry)) = self.entries.get_key_value(key) {
            let key = key.clone();
            let old = entry.tick;
            self.recency.remove(&old);
            self.recency.insert(tick, key.clone());
            if let Some(entry) = self.entries.get_mut::<K>(&key) {
                entry.tick = tick;
                entry.last_accessed_at = now;
            }
        }
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<Entry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.stats.size = self.entries.len();
        Some(entry)
    }

    fn victim(&self) -> Option<K> {
        match self.config.strategy {
            EvictionStrategy::Lru => self.recency.values().next().cloned(),
            EvictionStrategy::Lfu => self
                .entries
                .iter()
                .min_by(|(ka, a), (kb, b)| a.hit_count.cmp(&b.hit_count).then_with(|| ka.cmp(kb)))
                .map(|(key, _)| key.clone()),
            EvictionStrategy::Ttl => self
                .entries
                .iter()
                .min_by(|(ka, a), (kb, b)| a.expires_at.cmp(&b.expires_at).then_with(|| ka.cmp(kb)))
                .map(|(key, _)| key.clone()),
        }
    }

    fn evict(&mut self) -> Option<K> {
        let key = self.victim()?;
        self.remove(&key)?;
        self.stats.evictions += 1;
        Some(key)
    }
}

/// Bounded cache with LRU, LFU or TTL eviction.
#[derive(Debug)]
pub struct EvictionCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> Default for EvictionCache<K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<K, V> EvictionCache<K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.lock().config.clone()
    }

    /// Returns a clone of the value stored for `key`, if present and not expired.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let Some(expires_at) = inner.entries.get(key).map(|entry| entry.expires_at) else {
            inner.stats.misses += 1;
            return None;
        };

        if expires_at <= now {
            inner.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        inner.touch(key, now);
        inner.stats.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.hit_count += 1;
        Some(entry.value.clone())
    }

    /// Bookkeeping of `key` without counting as an access.
    pub fn inspect<Q>(&self, key: &Q) -> Option<EntryInfo>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let inner = self.inner.lock();
        let entry = inner.entries.get(key)?;
        Some(EntryInfo {
            hit_count: entry.hit_count,
            expires_in: entry.expires_at.saturating_duration_since(now),
            idle: now.saturating_duration_since(entry.last_accessed_at),
        })
    }

    /// Stores `value` under `key` with the default TTL.
    pub fn set(&self, key: K, value: V) {
        let ttl = self.inner.lock().config.default_ttl;
        self.set_with_ttl(key, value, ttl);
    }

    /// Stores `value` under `key`, expiring after `ttl`.
    ///
    /// If the cache is full and `key` is new, one entry is evicted first.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.config.capacity == 0 {
            return;
        }

        let expires_at = crate::deadline(now, ttl);
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            entry.hit_count += 1;
            inner.touch(&key, now);
            return;
        }

        if inner.entries.len() >= inner.config.capacity {
            inner.evict();
        }

        let tick = inner.next_tick();
        inner.recency.insert(tick, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                hit_count: 0,
                last_accessed_at: now,
                tick,
            },
        );
        inner.stats.size = inner.entries.len();
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().remove(key).map(|entry| entry.value)
    }

    /// Removes one entry chosen by the eviction strategy and returns its key.
    pub fn evict(&self) -> Option<K> {
        self.inner.lock().evict()
    }

    /// Removes every expired entry. Returns how many were removed.
    ///
    /// Works in batches so that concurrent readers are never blocked for
    /// longer than one batch.
    pub fn purge_expired(&self) -> usize {
        let mut removed = 0;
        loop {
            let now = Instant::now();
            let mut inner = self.inner.lock();
            let batch: Vec<K> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .take(SWEEP_BATCH)
                .collect();

            for key in &batch {
                inner.remove(key);
            }
            inner.stats.expirations += batch.len() as u64;
            removed += batch.len();

            if batch.len() < SWEEP_BATCH {
                break;
            }
        }

        if removed > 0 {
            log::debug!("cache sweep removed {removed} expired entries");
        }
        removed
    }

    /// Replaces the configuration, evicting until the new capacity holds.
    pub fn update_config(&self, config: CacheConfig) {
        let mut inner = self.inner.lock();
        inner.config = config;
        while inner.entries.len() > inner.config.capacity {
            if inner.evict().is_none() {
                break;
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.stats.size = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

impl<K, V> EvictionCache<K, V>
where
    K: Eq + Hash + Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Starts a task that purges expired entries every `sweep_interval`.
    ///
    /// The task only holds a weak reference and exits once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config().sweep_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.purge_expired();
            }
        })
    }
}
