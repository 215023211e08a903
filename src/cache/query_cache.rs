// # Query Result Cache
//
// Caches deterministic read-query results keyed by a fingerprint of
// the normalized SQL plus its parameter tuple. Each entry remembers
// the set of table names referenced by the query; a reverse index
// (table -> keys) makes table invalidation O(affected keys).

use super::region::{RegionConfig, TieredCache};
use super::CacheRegion;
use crate::common::{fingerprint, normalize_sql};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

lazy_static! {
    static ref TABLE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"\bfrom\s+`?([a-z0-9_$.]+)`?").unwrap(),
        Regex::new(r"\bjoin\s+`?([a-z0-9_$.]+)`?").unwrap(),
        Regex::new(r"\binsert\s+(?:ignore\s+)?into\s+`?([a-z0-9_$.]+)`?").unwrap(),
        Regex::new(r"\bupdate\s+(?:ignore\s+)?`?([a-z0-9_$.]+)`?").unwrap(),
        Regex::new(r"\bdelete\s+from\s+`?([a-z0-9_$.]+)`?").unwrap(),
        Regex::new(r"\b(?:create|alter|drop)\s+table\s+(?:if\s+(?:not\s+)?exists\s+)?`?([a-z0-9_$.]+)`?")
            .unwrap(),
        Regex::new(r"\btruncate\s+(?:table\s+)?`?([a-z0-9_$.]+)`?").unwrap(),
        Regex::new(r"\breplace\s+into\s+`?([a-z0-9_$.]+)`?").unwrap(),
    ];
}

/// Functions whose presence makes a query non-deterministic and
/// therefore uncacheable.
const NON_DETERMINISTIC_MARKERS: &[&str] = &[
    "now(",
    "curdate(",
    "curtime(",
    "sysdate(",
    "current_timestamp",
    "current_date",
    "current_time",
    "current_user",
    "rand(",
    "uuid(",
    "uuid_short(",
    "last_insert_id(",
    "connection_id(",
    "found_rows(",
    "row_count(",
    "sleep(",
    "benchmark(",
];

/// Read verbs eligible for result caching.
const CACHEABLE_VERBS: &[&str] = &["select", "show", "describe", "desc", "explain"];

/// Every this many stores, the reverse index is swept for keys whose
/// entries the region expired or evicted on its own.
const INDEX_SWEEP_INTERVAL: u64 = 64;

/// Whether a statement's result may be cached at all.
pub fn is_cacheable(sql: &str) -> bool {
    let normalized = normalize_sql(sql);
    let Some(first) = normalized.split_whitespace().next() else {
        return false;
    };
    if !CACHEABLE_VERBS.contains(&first) {
        return false;
    }
    !NON_DETERMINISTIC_MARKERS
        .iter()
        .any(|marker| normalized.contains(marker))
}

/// Table names referenced by a statement, lowercased, deduplicated.
pub fn extract_tables(sql: &str) -> Vec<String> {
    let normalized = normalize_sql(sql);
    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    for pattern in TABLE_PATTERNS.iter() {
        for captures in pattern.captures_iter(&normalized) {
            if let Some(name) = captures.get(1) {
                let table = name.as_str().trim_matches('`').to_string();
                if seen.insert(table.clone()) {
                    tables.push(table);
                }
            }
        }
    }
    tables
}

/// A cached, bounded-size query result.
#[derive(Debug, Clone, Serialize)]
pub struct CachedQueryResult {
    pub rows: Value,
    pub row_count: usize,
    pub size_bytes: usize,
    pub tables: Vec<String>,
}

/// Counters specific to the query cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryCacheStats {
    pub stored: u64,
    pub skipped_uncacheable: u64,
    pub skipped_too_large: u64,
    pub table_invalidations: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Fingerprint-keyed result cache with table-level invalidation.
pub struct QueryCache {
    store: TieredCache<Arc<CachedQueryResult>>,
    by_table: Mutex<HashMap<String, HashSet<String>>>,
    max_result_bytes: usize,
    enabled: bool,
    stored: AtomicU64,
    skipped_uncacheable: AtomicU64,
    skipped_too_large: AtomicU64,
    table_invalidations: AtomicU64,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration, max_result_bytes: usize, enabled: bool, tiered: bool) -> Self {
        let config = RegionConfig {
            capacity,
            ttl,
            tiered,
            ttl_adjustment: false,
        };
        Self {
            store: TieredCache::new(CacheRegion::QueryResult, config),
            by_table: Mutex::new(HashMap::new()),
            max_result_bytes,
            enabled,
            stored: AtomicU64::new(0),
            skipped_uncacheable: AtomicU64::new(0),
            skipped_too_large: AtomicU64::new(0),
            table_invalidations: AtomicU64::new(0),
        }
    }

    /// Look up a cached result for this statement and parameter tuple.
    pub fn lookup(&self, sql: &str, params: &[Value]) -> Option<Arc<CachedQueryResult>> {
        if !self.enabled || !is_cacheable(sql) {
            return None;
        }
        self.store.get(&fingerprint(sql, params))
    }

    /// Store a result; returns true when the entry was admitted.
    pub fn store(&self, sql: &str, params: &[Value], rows: Value, row_count: usize) -> bool {
        if !self.enabled {
            return false;
        }
        if !is_cacheable(sql) {
            self.skipped_uncacheable.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let size_bytes = rows.to_string().len();
        if size_bytes > self.max_result_bytes {
            self.skipped_too_large.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                component = "cache",
                size_bytes,
                limit = self.max_result_bytes,
                "query result too large to cache"
            );
            return false;
        }

        let key = fingerprint(sql, params);
        let tables = extract_tables(sql);
        let entry = Arc::new(CachedQueryResult {
            rows,
            row_count,
            size_bytes,
            tables: tables.clone(),
        });
        self.store.set(key.clone(), entry);
        let stored = self.stored.fetch_add(1, Ordering::Relaxed) + 1;

        {
            let mut index = self.by_table.lock();
            for table in tables {
                index.entry(table).or_default().insert(key.clone());
            }
        }
        if stored % INDEX_SWEEP_INTERVAL == 0 {
            self.sweep_index();
        }
        true
    }

    /// Drop every entry whose referenced-table set contains `table`.
    /// Each removed entry is unlinked from the buckets of every table
    /// it references, so a multi-table query leaves nothing behind.
    /// Idempotent: a second call with no indexed keys is a no-op.
    pub fn invalidate_table(&self, table: &str) -> usize {
        let table = table.to_lowercase();
        let keys = {
            let mut index = self.by_table.lock();
            index.remove(&table).unwrap_or_default()
        };
        let mut dropped = 0;
        for key in &keys {
            if let Some(entry) = self.store.take(key) {
                dropped += 1;
                self.prune_index(key, &entry.tables);
            }
        }
        if dropped > 0 {
            self.table_invalidations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(component = "cache", table = %table, dropped, "query cache invalidated");
        }
        dropped
    }

    /// Remove `key` from the bucket of every table in its dependency
    /// list, dropping buckets that empty out.
    fn prune_index(&self, key: &str, tables: &[String]) {
        let mut index = self.by_table.lock();
        for table in tables {
            let emptied = match index.get_mut(table) {
                Some(bucket) => {
                    bucket.remove(key);
                    bucket.is_empty()
                }
                None => false,
            };
            if emptied {
                index.remove(table);
            }
        }
    }

    /// Drop index keys whose entries already expired or were evicted
    /// by the region, plus any bucket that emptied out. Runs
    /// opportunistically from `store` so the reverse index stays
    /// bounded by the store's capacity.
    pub fn sweep_index(&self) {
        let mut index = self.by_table.lock();
        index.retain(|_, bucket| {
            bucket.retain(|key| self.store.contains_key(key));
            !bucket.is_empty()
        });
    }

    /// Total keys across all reverse-index buckets.
    pub fn indexed_key_count(&self) -> usize {
        self.by_table.lock().values().map(|bucket| bucket.len()).sum()
    }

    /// Conservative fallback when a mutated table cannot be parsed.
    pub fn invalidate_all(&self) {
        self.store.clear();
        self.by_table.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn set_pressure(&self, pressure: f64) {
        self.store.set_pressure(pressure);
    }

    pub fn stats(&self) -> QueryCacheStats {
        let region = self.store.stats();
        QueryCacheStats {
            stored: self.stored.load(Ordering::Relaxed),
            skipped_uncacheable: self.skipped_uncacheable.load(Ordering::Relaxed),
            skipped_too_large: self.skipped_too_large.load(Ordering::Relaxed),
            table_invalidations: self.table_invalidations.load(Ordering::Relaxed),
            hits: region.hits,
            misses: region.misses,
        }
    }
}
