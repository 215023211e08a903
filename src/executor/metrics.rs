// # Executor Metrics
//
// Counters and latency aggregates for the query pipeline. Updates are
// lock-light; snapshots are serializable for the diagnostics surface.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Serializable metrics view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub queries_total: u64,
    pub queries_failed: u64,
    pub errors_by_category: HashMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub slow_queries: u64,
    pub retried_queries: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
}

/// Shared metrics sink for the executor.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    queries_total: AtomicU64,
    queries_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    slow_queries: AtomicU64,
    retried_queries: AtomicU64,
    latency_sum_micros: AtomicU64,
    latency_count: AtomicU64,
    latency_max_micros: AtomicU64,
    errors_by_category: Mutex<HashMap<&'static str, u64>>,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed operation.
    pub fn record_query(&self, elapsed: Duration, slow_threshold: Duration, attempts: u32) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        if attempts > 1 {
            self.retried_queries.fetch_add(1, Ordering::Relaxed);
        }
        if elapsed > slow_threshold {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                component = "executor",
                elapsed_ms = elapsed.as_millis() as u64,
                "slow query"
            );
        }
        let micros = elapsed.as_micros() as u64;
        self.latency_sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn record_failure(&self, category: &'static str) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        self.queries_failed.fetch_add(1, Ordering::Relaxed);
        *self.errors_by_category.lock().entry(category).or_insert(0) += 1;
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let count = self.latency_count.load(Ordering::Relaxed);
        let sum = self.latency_sum_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            queries_total: self.queries_total.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            errors_by_category: self
                .errors_by_category
                .lock()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            retried_queries: self.retried_queries.load(Ordering::Relaxed),
            avg_latency_ms: if count == 0 {
                0.0
            } else {
                (sum as f64 / count as f64) / 1000.0
            },
            max_latency_ms: self.latency_max_micros.load(Ordering::Relaxed) / 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_and_slow_accounting() {
        let metrics = ExecutorMetrics::new();
        metrics.record_query(Duration::from_millis(10), Duration::from_millis(100), 1);
        metrics.record_query(Duration::from_millis(300), Duration::from_millis(100), 2);

        let snap = metrics.snapshot();
        assert_eq!(snap.queries_total, 2);
        assert_eq!(snap.slow_queries, 1);
        assert_eq!(snap.retried_queries, 1);
        assert!(snap.avg_latency_ms > 0.0);
        assert!(snap.max_latency_ms >= 300);
    }

    #[test]
    fn test_failure_categories() {
        let metrics = ExecutorMetrics::new();
        metrics.record_failure("deadlock");
        metrics.record_failure("deadlock");
        metrics.record_failure("timeout");
        let snap = metrics.snapshot();
        assert_eq!(snap.queries_failed, 3);
        assert_eq!(snap.errors_by_category["deadlock"], 2);
        assert_eq!(snap.errors_by_category["timeout"], 1);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = ExecutorMetrics::new();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        let snap = metrics.snapshot();
        assert!((snap.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
