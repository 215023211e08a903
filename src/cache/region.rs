// # Tiered Cache Region
//
// A two-tier LRU with per-entry TTL. L1 holds hot data; eviction from
// L1 demotes to L2 unless the entry expired; an L2 hit promotes back
// into L1. Both tiers of a region share one lock. The dynamic cap
// contracts under memory pressure and cap enforcement is a pure
// function of (cap, LRU order) run under that lock.

use super::{CacheRegion, RegionStats, L1_SHARE, PRESSURE_FLUSH_THRESHOLD, PRESSURE_SHRINK_THRESHOLD};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Tuning for one region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Total entry budget across both tiers.
    pub capacity: usize,
    /// Default entry TTL.
    pub ttl: Duration,
    /// When false the region degenerates to a single LRU.
    pub tiered: bool,
    /// Extend the TTL of frequently accessed entries.
    pub ttl_adjustment: bool,
}

impl RegionConfig {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            tiered: true,
            ttl_adjustment: false,
        }
    }
}

/// Accesses after which the adaptive TTL extension kicks in.
const HOT_ACCESS_THRESHOLD: u64 = 3;

/// Adaptive TTL never extends an entry past `created_at + ttl * CEILING`.
const TTL_CEILING_MULTIPLIER: u32 = 4;

struct Entry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    access_count: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// One LRU tier: map plus access order, front = coldest.
struct Tier<V> {
    map: HashMap<String, Entry<V>>,
    order: VecDeque<String>,
}

impl<V> Tier<V> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn insert(&mut self, key: String, entry: Entry<V>) {
        if self.map.insert(key.clone(), entry).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);
    }

    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    fn pop_coldest(&mut self) -> Option<(String, Entry<V>)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(entry) = self.map.remove(&key) {
                return Some((key, entry));
            }
        }
        None
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

struct Inner<V> {
    l1: Tier<V>,
    l2: Tier<V>,
    l1_cap: usize,
    l2_cap: usize,
    stats: RegionStats,
}

/// A size-bounded, TTL-expiring, pressure-aware cache region.
pub struct TieredCache<V: Clone> {
    region: CacheRegion,
    config: RegionConfig,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> TieredCache<V> {
    pub fn new(region: CacheRegion, config: RegionConfig) -> Self {
        let (l1_cap, l2_cap) = split_caps(config.capacity, config.tiered);
        Self {
            region,
            config,
            inner: Mutex::new(Inner {
                l1: Tier::new(),
                l2: Tier::new(),
                l1_cap,
                l2_cap,
                stats: RegionStats::default(),
            }),
        }
    }

    pub fn region(&self) -> CacheRegion {
        self.region
    }

    /// Look a key up, refreshing LRU order and promoting L2 hits.
    /// Expired entries are removed and reported as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();

        let l1_state = inner.l1.map.get(key).map(Entry::is_expired);
        match l1_state {
            Some(true) => {
                inner.l1.remove(key);
                inner.stats.expired_evictions += 1;
                inner.stats.misses += 1;
                return None;
            }
            Some(false) => {
                let mut value = None;
                if let Some(entry) = inner.l1.map.get_mut(key) {
                    entry.access_count += 1;
                    if self.config.ttl_adjustment && entry.access_count >= HOT_ACCESS_THRESHOLD {
                        let ceiling = entry.created_at + self.config.ttl * TTL_CEILING_MULTIPLIER;
                        let extended = entry.expires_at + self.config.ttl / 2;
                        entry.expires_at = extended.min(ceiling);
                    }
                    value = Some(entry.value.clone());
                }
                inner.l1.touch(key);
                inner.stats.hits += 1;
                return value;
            }
            None => {}
        }

        if let Some(mut entry) = inner.l2.remove(key) {
            if entry.is_expired() {
                inner.stats.expired_evictions += 1;
                inner.stats.misses += 1;
                return None;
            }
            entry.access_count += 1;
            let value = entry.value.clone();
            inner.l1.insert(key.to_string(), entry);
            inner.stats.promotions += 1;
            inner.stats.hits += 1;
            Self::enforce_caps(&mut inner, self.config.tiered);
            return Some(value);
        }

        inner.stats.misses += 1;
        None
    }

    /// Insert into the hot tier with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, None);
    }

    /// Insert into the hot tier; `ttl` overrides the region default.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.config.ttl);
        let entry = Entry {
            value,
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
        };

        let mut inner = self.inner.lock();
        // A key lives in at most one tier.
        inner.l2.remove(&key);
        inner.l1.insert(key, entry);
        inner.stats.insertions += 1;
        Self::enforce_caps(&mut inner, self.config.tiered);
    }

    /// Remove one key from whichever tier holds it.
    pub fn invalidate(&self, key: &str) -> bool {
        self.take(key).is_some()
    }

    /// Remove one key and hand its value back, so callers can unlink
    /// bookkeeping that hangs off the entry.
    pub fn take(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let removed = inner.l1.remove(key).or_else(|| inner.l2.remove(key));
        if removed.is_some() {
            inner.stats.invalidation_evictions += 1;
        }
        removed.map(|entry| entry.value)
    }

    /// Presence check that leaves LRU order, TTLs and the hit/miss
    /// counters untouched. Expired entries count as absent.
    pub fn contains_key(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .l1
            .map
            .get(key)
            .map_or(false, |entry| !entry.is_expired())
            || inner
                .l2
                .map
                .get(key)
                .map_or(false, |entry| !entry.is_expired())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.l1.clear();
        inner.l2.clear();
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.l1.len() + inner.l2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// React to a published pressure value: contract the dynamic cap at
    /// p >= 0.7, flush the warm tier at p >= 0.85, restore below.
    pub fn set_pressure(&self, pressure: f64) {
        let mut inner = self.inner.lock();
        let (l1_cap, l2_cap) = if pressure >= PRESSURE_SHRINK_THRESHOLD {
            let factor = (1.0 - pressure + 0.3).clamp(0.05, 1.0);
            let shrunk = ((self.config.capacity as f64) * factor).floor() as usize;
            split_caps(shrunk.max(1), self.config.tiered)
        } else {
            split_caps(self.config.capacity, self.config.tiered)
        };
        inner.l1_cap = l1_cap;
        inner.l2_cap = l2_cap;

        let before = inner.l1.len() + inner.l2.len();
        Self::enforce_caps(&mut inner, self.config.tiered);

        if pressure >= PRESSURE_FLUSH_THRESHOLD {
            let flushed = inner.l2.len();
            inner.l2.clear();
            inner.stats.pressure_evictions += flushed as u64;
        }
        let after = inner.l1.len() + inner.l2.len();
        if after < before {
            tracing::debug!(
                component = "cache",
                region = self.region.as_str(),
                pressure,
                evicted = before - after,
                "pressure-driven eviction"
            );
        }
    }

    pub fn stats(&self) -> RegionStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.l1_len = inner.l1.len();
        stats.l2_len = inner.l2.len();
        stats.l1_cap = inner.l1_cap;
        stats.l2_cap = inner.l2_cap;
        stats
    }

    /// Trim both tiers to their caps: excess L1 entries demote to L2
    /// (unless expired), excess L2 entries drop coldest-first.
    fn enforce_caps(inner: &mut Inner<V>, tiered: bool) {
        while inner.l1.len() > inner.l1_cap {
            let Some((key, entry)) = inner.l1.pop_coldest() else {
                break;
            };
            if entry.is_expired() {
                inner.stats.expired_evictions += 1;
            } else if tiered && inner.l2_cap > 0 {
                inner.l2.insert(key, entry);
                inner.stats.demotions += 1;
            } else {
                inner.stats.capacity_evictions += 1;
            }
        }
        while inner.l2.len() > inner.l2_cap {
            if inner.l2.pop_coldest().is_none() {
                break;
            }
            inner.stats.capacity_evictions += 1;
        }
    }
}

fn split_caps(capacity: usize, tiered: bool) -> (usize, usize) {
    if !tiered {
        return (capacity.max(1), 0);
    }
    let l1 = (((capacity as f64) * L1_SHARE).floor() as usize).max(1);
    let l2 = capacity.saturating_sub(l1);
    (l1, l2)
}
