// # Memory Monitoring
//
// Process-memory sampling, the pressure scalar published to the pool
// and cache subsystems, and the weak-reference object registry used by
// the periodic cleanup pass.

pub mod pressure;

pub use pressure::{PressureController, PressureSubscriber, PressureUpdate};

use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Idle time after which a registered object is dropped from tracking.
pub const DEFAULT_CLEANUP_IDLE: Duration = Duration::from_secs(300);

/// One sampled view of process memory.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    /// Resident set size in bytes.
    pub rss: u64,
    /// Heap proxy; equals `rss` on platforms without allocator hooks.
    pub heap_used: u64,
    /// Reference ceiling the pressure ratio is computed against.
    pub heap_total: u64,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    /// Pressure scalar in [0, 1].
    pub pressure: f64,
    /// Set when the regression heuristic suspects unbounded growth.
    pub leak_suspected: bool,
}

impl MemorySnapshot {
    /// Collect a snapshot against the given system reference.
    pub fn collect(system_ref: u64) -> Self {
        let rss = read_process_rss().unwrap_or(0);
        Self::from_rss(rss, system_ref)
    }

    /// Build a snapshot from a known RSS value (test hook and replay).
    pub fn from_rss(rss: u64, system_ref: u64) -> Self {
        let reference = system_ref.max(1);
        let pressure = (rss as f64 / reference as f64).clamp(0.0, 1.0);
        Self {
            rss,
            heap_used: rss,
            heap_total: reference,
            ts: crate::common::now_millis(),
            pressure,
            leak_suspected: false,
        }
    }
}

/// Total system memory in bytes, chosen once at startup as the
/// pressure reference. Falls back to 8 GiB when unreadable.
pub fn system_reference() -> u64 {
    read_system_total().unwrap_or(8 * 1024 * 1024 * 1024)
}

#[cfg(target_os = "linux")]
fn read_system_total() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("MemTotal:") {
            let kb = parts.next()?.parse::<u64>().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_system_total() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn read_process_rss() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("VmRSS:") {
            let kb = parts.next()?.parse::<u64>().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_process_rss() -> Option<u64> {
    None
}

/// Linear-regression slope of heap samples, flagged as a leak when the
/// per-sample growth exceeds 5% of the series baseline.
pub fn leak_suspected(samples: &[u64]) -> bool {
    if samples.len() < 5 {
        return false;
    }
    let n = samples.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = samples.iter().sum::<u64>() as f64 / n;
    if mean_y <= 0.0 {
        return false;
    }

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in samples.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (*y as f64 - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        return false;
    }
    let slope = num / den;
    slope / mean_y > 0.05
}

struct TrackedObject {
    handle: Weak<dyn Any + Send + Sync>,
    size: usize,
    last_access: Instant,
}

/// Registry of weakly-referenced objects with idle-time cleanup.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: parking_lot::Mutex<HashMap<String, TrackedObject>>,
}

/// Result of a registry cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dead: usize,
    pub idle: usize,
    pub remaining: usize,
    pub bytes_released: usize,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an object without extending its lifetime.
    pub fn register(&self, id: impl Into<String>, object: &Arc<dyn Any + Send + Sync>, size: usize) {
        let mut objects = self.objects.lock();
        objects.insert(
            id.into(),
            TrackedObject {
                handle: Arc::downgrade(object),
                size,
                last_access: Instant::now(),
            },
        );
    }

    /// Refresh the idle clock for an object.
    pub fn touch(&self, id: &str) {
        if let Some(entry) = self.objects.lock().get_mut(id) {
            entry.last_access = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Drop entries whose weak reference died or whose idle time
    /// exceeds `idle_threshold`.
    pub fn cleanup(&self, idle_threshold: Duration) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut objects = self.objects.lock();
        objects.retain(|_, entry| {
            if entry.handle.strong_count() == 0 {
                report.dead += 1;
                report.bytes_released += entry.size;
                false
            } else if entry.last_access.elapsed() > idle_threshold {
                report.idle += 1;
                report.bytes_released += entry.size;
                false
            } else {
                true
            }
        });
        report.remaining = objects.len();
        report
    }

    /// Emergency pass: forget everything tracked.
    pub fn clear(&self) -> usize {
        let mut objects = self.objects.lock();
        let count = objects.len();
        objects.clear();
        count
    }
}
