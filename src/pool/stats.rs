// # Pool Statistics & Persistence
//
// Counters shared across pool incarnations plus the JSON stats file
// written every few minutes and read back at startup so dashboards do
// not regress across restarts. The file is replaced atomically
// (write-temp-then-rename).

use crate::common::now_rfc3339;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters; cheap to update from any thread.
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub created: AtomicU64,
    pub closed: AtomicU64,
    pub acquire_timeouts: AtomicU64,
    pub double_releases: AtomicU64,
    pub leaks_detected: AtomicU64,
    pub forced_releases: AtomicU64,
    pub health_failures_total: AtomicU64,
    pub recoveries: AtomicU64,
}

/// Serializable view of the counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub acquired: u64,
    pub released: u64,
    pub created: u64,
    pub closed: u64,
    pub acquire_timeouts: u64,
    pub double_releases: u64,
    pub leaks_detected: u64,
    pub forced_releases: u64,
    pub health_failures_total: u64,
    pub recoveries: u64,
}

impl PoolCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            double_releases: self.double_releases.load(Ordering::Relaxed),
            leaks_detected: self.leaks_detected.load(Ordering::Relaxed),
            forced_releases: self.forced_releases.load(Ordering::Relaxed),
            health_failures_total: self.health_failures_total.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }

    /// Seed the counters from a persisted snapshot.
    pub fn restore(&self, snapshot: &CounterSnapshot) {
        self.acquired.store(snapshot.acquired, Ordering::Relaxed);
        self.released.store(snapshot.released, Ordering::Relaxed);
        self.created.store(snapshot.created, Ordering::Relaxed);
        self.closed.store(snapshot.closed, Ordering::Relaxed);
        self.acquire_timeouts
            .store(snapshot.acquire_timeouts, Ordering::Relaxed);
        self.double_releases
            .store(snapshot.double_releases, Ordering::Relaxed);
        self.leaks_detected
            .store(snapshot.leaks_detected, Ordering::Relaxed);
        self.forced_releases
            .store(snapshot.forced_releases, Ordering::Relaxed);
        self.health_failures_total
            .store(snapshot.health_failures_total, Ordering::Relaxed);
        self.recoveries.store(snapshot.recoveries, Ordering::Relaxed);
    }
}

/// The persisted stats file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatsFile {
    pub ts: String,
    pub db: String,
    pub stats: CounterSnapshot,
    pub cap: usize,
    #[serde(rename = "recentWaits")]
    pub recent_waits_ms: Vec<u64>,
    #[serde(rename = "healthFailures")]
    pub health_failures: u32,
    #[serde(rename = "lastHealthCheck")]
    pub last_health_check: Option<String>,
}

impl PoolStatsFile {
    pub fn new(
        db: &str,
        stats: CounterSnapshot,
        cap: usize,
        recent_waits_ms: Vec<u64>,
        health_failures: u32,
        last_health_check: Option<String>,
    ) -> Self {
        Self {
            ts: now_rfc3339(),
            db: db.to_string(),
            stats,
            cap,
            recent_waits_ms,
            health_failures,
            last_health_check,
        }
    }
}

/// Atomically replace the stats file. Errors are returned so callers
/// can log them; they must never fail a user request.
pub fn save_stats(path: &Path, stats: &PoolStatsFile) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(stats)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Load a persisted stats file; unreadable or unparseable files are
/// treated as absent.
pub fn load_stats(path: &Path) -> Option<PoolStatsFile> {
    let body = std::fs::read(path).ok()?;
    match serde_json::from_slice(&body) {
        Ok(stats) => Some(stats),
        Err(err) => {
            tracing::warn!(
                component = "pool",
                path = %path.display(),
                error = %err,
                "ignoring unparseable pool stats file"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_restore_roundtrip() {
        let counters = PoolCounters::default();
        counters.acquired.store(10, Ordering::Relaxed);
        counters.leaks_detected.store(2, Ordering::Relaxed);

        let snapshot = counters.snapshot();
        let fresh = PoolCounters::default();
        fresh.restore(&snapshot);
        assert_eq!(fresh.acquired.load(Ordering::Relaxed), 10);
        assert_eq!(fresh.leaks_detected.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_save_and_load_stats_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool_stats.json");
        let file = PoolStatsFile::new(
            "appdb",
            CounterSnapshot {
                acquired: 42,
                ..CounterSnapshot::default()
            },
            8,
            vec![12, 30, 7],
            1,
            Some(now_rfc3339()),
        );
        save_stats(&path, &file).unwrap();

        let loaded = load_stats(&path).unwrap();
        assert_eq!(loaded.db, "appdb");
        assert_eq!(loaded.stats.acquired, 42);
        assert_eq!(loaded.cap, 8);
        assert_eq!(loaded.recent_waits_ms, vec![12, 30, 7]);
        // No stray temp file remains.
        assert!(!dir.path().join("pool_stats.json.tmp").exists());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool_stats.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(load_stats(&path).is_none());
        assert!(load_stats(&dir.path().join("missing.json")).is_none());
    }
}
