// # Cache Manager
//
// Owns every cache region, routes region-addressed operations, maps
// operation types to invalidations, subscribes the whole subsystem to
// the memory-pressure channel and drives startup warm-up.

use super::query_cache::{QueryCache, QueryCacheStats};
use super::region::{RegionConfig, TieredCache};
use super::{CacheRegion, RegionStats};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::memory::{PressureSubscriber, PressureUpdate};
use crate::security::QueryVerb;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Loads schema facts during warm-up; implemented over the pool.
#[async_trait]
pub trait WarmupLoader: Send + Sync {
    async fn table_schema(&self, table: &str) -> Result<Value>;
    async fn table_exists(&self, table: &str) -> Result<bool>;
}

/// Outcome of a warm-up pass; informational only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmupReport {
    pub warmed: usize,
    pub failed: usize,
}

/// Aggregate snapshot across regions.
#[derive(Debug, Clone, Serialize)]
pub struct CacheManagerStats {
    pub schema: RegionStats,
    pub table_exists: RegionStats,
    pub index: RegionStats,
    pub generic: RegionStats,
    pub query: QueryCacheStats,
}

/// All cache regions behind one façade.
pub struct CacheManager {
    schema: TieredCache<Value>,
    table_exists: TieredCache<Value>,
    index: TieredCache<Value>,
    generic: TieredCache<Value>,
    query: QueryCache,
}

impl CacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        let tiered = config.enable_tiered_cache;
        let ttl = config.cache_ttl;
        let region_config = |capacity: usize| RegionConfig {
            capacity,
            ttl,
            tiered,
            ttl_adjustment: config.enable_ttl_adjustment,
        };
        Self {
            schema: TieredCache::new(CacheRegion::Schema, region_config(config.schema_cache_size)),
            table_exists: TieredCache::new(
                CacheRegion::TableExists,
                region_config(config.table_exists_cache_size),
            ),
            index: TieredCache::new(CacheRegion::Index, region_config(config.index_cache_size)),
            generic: TieredCache::new(CacheRegion::Generic, region_config(config.schema_cache_size)),
            query: QueryCache::new(
                config.query_cache_size,
                config.query_cache_ttl,
                config.max_query_result_bytes,
                config.enable_query_cache,
                tiered,
            ),
        }
    }

    fn value_region(&self, region: CacheRegion) -> &TieredCache<Value> {
        match region {
            CacheRegion::Schema => &self.schema,
            CacheRegion::TableExists => &self.table_exists,
            CacheRegion::Index => &self.index,
            // Query results flow through the typed query() API; the
            // generic region backs any remaining ad-hoc use.
            CacheRegion::QueryResult | CacheRegion::Generic => &self.generic,
        }
    }

    pub fn get(&self, region: CacheRegion, key: &str) -> Option<Value> {
        self.value_region(region).get(key)
    }

    pub fn set(&self, region: CacheRegion, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        self.value_region(region).set_with_ttl(key, value, ttl);
    }

    pub fn invalidate(&self, region: CacheRegion, key: &str) -> bool {
        self.value_region(region).invalidate(key)
    }

    /// The query-result cache.
    pub fn query(&self) -> &QueryCache {
        &self.query
    }

    /// Drop every cached fact about `table` across all regions.
    pub fn invalidate_table(&self, table: &str) {
        let table = table.to_lowercase();
        self.query.invalidate_table(&table);
        self.schema.invalidate(&table);
        self.table_exists.invalidate(&table);
        self.index.invalidate(&table);
    }

    /// Map an executed operation to the invalidation it requires.
    /// DML drops query results for the table; DDL additionally drops
    /// the schema-shaped regions. An unparseable target invalidates
    /// the whole query cache conservatively.
    pub fn invalidate_by_operation(&self, verb: QueryVerb, table: Option<&str>) {
        if verb.is_read() {
            return;
        }
        match table {
            Some(table) => {
                if verb.is_ddl() {
                    self.invalidate_table(table);
                } else {
                    self.query.invalidate_table(&table.to_lowercase());
                }
            }
            None => {
                tracing::warn!(
                    component = "cache",
                    verb = verb.as_str(),
                    "mutating statement without a parsed table; clearing query cache"
                );
                self.query.invalidate_all();
                if verb.is_ddl() {
                    self.schema.clear();
                    self.table_exists.clear();
                    self.index.clear();
                }
            }
        }
    }

    pub fn clear_all(&self) {
        self.schema.clear();
        self.table_exists.clear();
        self.index.clear();
        self.generic.clear();
        self.query.invalidate_all();
    }

    /// Prefetch schema and existence facts for the given tables.
    /// Failures are reported and logged, never fatal.
    pub async fn warm_up(&self, tables: &[String], loader: Arc<dyn WarmupLoader>) -> WarmupReport {
        let mut report = WarmupReport::default();
        for table in tables {
            let key = table.to_lowercase();
            let mut ok = true;
            match loader.table_schema(table).await {
                Ok(schema) => self.schema.set(key.clone(), schema),
                Err(err) => {
                    ok = false;
                    tracing::warn!(component = "cache", table = %table, error = %err, "schema warm-up failed");
                }
            }
            match loader.table_exists(table).await {
                Ok(exists) => self.table_exists.set(key, Value::Bool(exists)),
                Err(err) => {
                    ok = false;
                    tracing::warn!(component = "cache", table = %table, error = %err, "exists warm-up failed");
                }
            }
            if ok {
                report.warmed += 1;
            } else {
                report.failed += 1;
            }
            tracing::debug!(
                component = "cache",
                table = %table,
                warmed = report.warmed,
                failed = report.failed,
                "warm-up progress"
            );
        }
        report
    }

    pub fn stats(&self) -> CacheManagerStats {
        CacheManagerStats {
            schema: self.schema.stats(),
            table_exists: self.table_exists.stats(),
            index: self.index.stats(),
            generic: self.generic.stats(),
            query: self.query.stats(),
        }
    }

    fn apply_pressure(&self, pressure: f64) {
        self.schema.set_pressure(pressure);
        self.table_exists.set_pressure(pressure);
        self.index.set_pressure(pressure);
        self.generic.set_pressure(pressure);
        self.query.set_pressure(pressure);
    }
}

impl PressureSubscriber for CacheManager {
    fn name(&self) -> &'static str {
        "cache-manager"
    }

    fn on_pressure(&self, update: PressureUpdate) -> Result<()> {
        self.apply_pressure(update.pressure);
        Ok(())
    }
}
