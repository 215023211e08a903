// # Session Manager
//
// Owns the primary pool and the replica set: read/write routing with
// round-robin and primary fallback, background health checks, dynamic
// double-buffered resizing, leak detection, staged recovery and stats
// persistence. All long-running loops carry a shutdown signal and are
// awaited by `close()`.

use super::breaker::{BreakerConfig, CircuitState};
use super::endpoint::{EndpointConfig, EndpointPool, EndpointSnapshot};
use super::connection::ConnectionHandle;
use super::stats::{load_stats, save_stats, PoolCounters, PoolStatsFile};
use crate::audit::AuditSink;
use crate::backend::Connector;
use crate::config::DatabaseConfig;
use crate::error::{Result, Severity};
use crate::memory::{PressureSubscriber, PressureUpdate};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Consecutive health failures that schedule a pool-size adjustment.
const HEALTH_FAILURES_FOR_RESIZE: u32 = 3;

/// Consecutive health failures that enter staged recovery.
const HEALTH_FAILURES_FOR_RECOVERY: u32 = 5;

/// Total leaked borrows that raise a critical alert.
const LEAK_ALERT_THRESHOLD: u64 = 10;

/// Grow step when acquire waits run hot.
const RESIZE_GROW_STEP: usize = 3;

/// Shrink step when waits are cold or the system is loaded.
const RESIZE_SHRINK_STEP: usize = 2;

/// Session-manager tuning derived from the database config.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub db_name: String,
    pub min: usize,
    pub max: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub health_interval: Duration,
    pub leak_scan_interval: Duration,
    pub leak_threshold: Duration,
    pub stats_interval: Duration,
    pub drain_timeout: Duration,
    pub breaker: BreakerConfig,
    /// Stats file location; `None` disables persistence.
    pub stats_path: Option<PathBuf>,
}

impl SessionManagerConfig {
    pub fn from_database(config: &DatabaseConfig, stats_path: Option<PathBuf>) -> Self {
        Self {
            db_name: config.database.clone(),
            min: config.pool_min,
            max: config.pool_max,
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            health_interval: Duration::from_secs(30),
            leak_scan_interval: Duration::from_secs(30),
            leak_threshold: Duration::from_secs(60),
            stats_interval: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
            stats_path,
        }
    }
}

/// Diagnostics snapshot across endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionManagerSnapshot {
    pub cap: usize,
    pub primary: EndpointSnapshot,
    pub replicas: Vec<EndpointSnapshot>,
    pub stats: super::stats::CounterSnapshot,
}

/// Pool façade the executor acquires connections from.
pub struct SessionManager {
    config: SessionManagerConfig,
    primary_connector: Arc<dyn Connector>,
    primary: RwLock<Arc<EndpointPool>>,
    replicas: Vec<Arc<EndpointPool>>,
    rr: AtomicUsize,
    counters: Arc<PoolCounters>,
    current_cap: AtomicUsize,
    /// System load published by the memory controller, as f64 bits.
    load_bits: AtomicU64,
    health_paused: AtomicBool,
    recovery_in_progress: AtomicBool,
    leak_alert_raised: AtomicBool,
    audit: Arc<AuditSink>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        primary_connector: Arc<dyn Connector>,
        replica_connectors: Vec<Arc<dyn Connector>>,
        audit: Arc<AuditSink>,
    ) -> Arc<Self> {
        let counters = Arc::new(PoolCounters::default());

        // Restore persisted counters so dashboards keep continuity.
        let mut initial_cap = ((config.min + config.max) / 2).clamp(config.min, config.max);
        if let Some(path) = &config.stats_path {
            if let Some(persisted) = load_stats(path) {
                counters.restore(&persisted.stats);
                if (config.min..=config.max).contains(&persisted.cap) {
                    initial_cap = persisted.cap;
                }
                tracing::info!(
                    component = "pool",
                    cap = initial_cap,
                    "restored pool stats from disk"
                );
            }
        }

        let primary = EndpointPool::new(
            Arc::clone(&primary_connector),
            EndpointConfig {
                cap: initial_cap,
                acquire_timeout: config.connect_timeout,
                idle_timeout: config.idle_timeout,
                breaker: config.breaker.clone(),
            },
            Arc::clone(&counters),
        );
        let replicas = replica_connectors
            .into_iter()
            .map(|connector| {
                EndpointPool::new(
                    connector,
                    EndpointConfig {
                        cap: initial_cap,
                        acquire_timeout: config.connect_timeout,
                        idle_timeout: config.idle_timeout,
                        breaker: config.breaker.clone(),
                    },
                    Arc::clone(&counters),
                )
            })
            .collect();

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            current_cap: AtomicUsize::new(initial_cap),
            primary: RwLock::new(primary),
            replicas,
            rr: AtomicUsize::new(0),
            counters,
            load_bits: AtomicU64::new(0f64.to_bits()),
            health_paused: AtomicBool::new(false),
            recovery_in_progress: AtomicBool::new(false),
            leak_alert_raised: AtomicBool::new(false),
            audit,
            tasks: Mutex::new(Vec::new()),
            shutdown,
            primary_connector,
            config,
        })
    }

    pub fn cap(&self) -> usize {
        self.current_cap.load(Ordering::Relaxed)
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    fn primary_pool(&self) -> Arc<EndpointPool> {
        self.primary.read().clone()
    }

    /// Borrow a read-write connection from the primary.
    pub async fn get_write(&self, tag: Option<String>) -> Result<ConnectionHandle> {
        self.primary_pool().acquire(tag).await
    }

    /// Borrow a read connection: round-robin over healthy replicas,
    /// primary as the fallback.
    pub async fn get_read(&self, tag: Option<String>) -> Result<ConnectionHandle> {
        if self.replicas.is_empty() {
            return self.get_write(tag).await;
        }
        let count = self.replicas.len();
        let start = self.rr.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            let pool = &self.replicas[(start + offset) % count];
            if !pool.is_healthy() || pool.breaker().state() == CircuitState::Open {
                continue;
            }
            match pool.acquire(tag.clone()).await {
                Ok(handle) => return Ok(handle),
                Err(err) => {
                    tracing::warn!(
                        component = "pool",
                        replica = %pool.endpoint(),
                        error = %err,
                        "replica acquire failed; trying next"
                    );
                }
            }
        }
        tracing::debug!(component = "pool", "no healthy replica; read falls back to primary");
        self.get_write(tag).await
    }

    /// Spawn the health, leak-detection and stats-persistence loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        // Health checker.
        {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            let interval = self.config.health_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.health_cycle().await,
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Leak detector.
        {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            let interval = self.config.leak_scan_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.leak_cycle(),
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Stats persistence.
        if self.config.stats_path.is_some() {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            let interval = self.config.stats_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.persist_stats(),
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }
    }

    /// One health pass over every endpoint, then resize/recovery
    /// decisions for the primary.
    pub async fn health_cycle(self: &Arc<Self>) {
        if self.health_paused.load(Ordering::Acquire) {
            return;
        }
        let ping_timeout = self.config.connect_timeout / 2;

        let primary = self.primary_pool();
        primary.health_check(ping_timeout).await;
        for replica in &self.replicas {
            replica.health_check(ping_timeout).await;
        }

        let failures = primary.health_failures();
        if failures >= HEALTH_FAILURES_FOR_RECOVERY {
            self.staged_recovery().await;
            return;
        }
        if failures >= HEALTH_FAILURES_FOR_RESIZE {
            // Repeated probe failures shrink the pool to relieve the
            // struggling backend.
            let next = self.cap().saturating_sub(RESIZE_SHRINK_STEP).max(self.config.min);
            if next != self.cap() {
                self.rebuild_primary(next).await;
            }
            return;
        }
        self.evaluate_resize().await;
    }

    /// Apply the resize rules and rebuild the primary when the cap
    /// changes. Bounded by (min, max).
    pub async fn evaluate_resize(self: &Arc<Self>) {
        let primary = self.primary_pool();
        let samples = primary.recent_waits_ms().len();
        let (avg_wait, rising) = primary.wait_profile();
        let cap = self.cap();
        let load = self.load();
        let mut next = cap;

        // Wait-driven decisions need a minimally filled ring.
        if samples < 8 && load <= 0.8 {
            return;
        }

        if load > 0.8 && cap > self.config.min {
            next = cap.saturating_sub(RESIZE_SHRINK_STEP);
        } else if avg_wait > Duration::from_millis(200) && rising && cap < self.config.max {
            next = cap + RESIZE_GROW_STEP;
        } else if avg_wait < Duration::from_millis(50) && !rising && cap > self.config.min {
            next = cap.saturating_sub(RESIZE_SHRINK_STEP);
        }

        let next = next.clamp(self.config.min, self.config.max);
        if next != cap {
            tracing::info!(
                component = "pool",
                from = cap,
                to = next,
                avg_wait_ms = avg_wait.as_millis() as u64,
                load,
                "resizing primary pool"
            );
            self.rebuild_primary(next).await;
        }
    }

    /// Double-buffered pool recreate: build, warm, swap, drain the old
    /// incarnation. Health checks pause across the swap.
    async fn rebuild_primary(self: &Arc<Self>, new_cap: usize) {
        self.health_paused.store(true, Ordering::Release);
        let fresh = EndpointPool::new(
            Arc::clone(&self.primary_connector),
            EndpointConfig {
                cap: new_cap,
                acquire_timeout: self.config.connect_timeout,
                idle_timeout: self.config.idle_timeout,
                breaker: self.config.breaker.clone(),
            },
            Arc::clone(&self.counters),
        );
        fresh.warm(self.config.min).await;

        let old = {
            let mut primary = self.primary.write();
            let old = primary.clone();
            *primary = fresh;
            old
        };
        self.current_cap.store(new_cap, Ordering::Relaxed);
        old.drain(self.config.drain_timeout).await;
        self.health_paused.store(false, Ordering::Release);
    }

    /// Five consecutive health failures land here: rebuild smaller,
    /// validate, force-rebuild at min if still dead, pre-warm and
    /// re-validate, then either close the breaker or raise a critical
    /// alert with a persisted recovery record.
    pub async fn staged_recovery(self: &Arc<Self>) {
        if self.recovery_in_progress.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(component = "pool", "entering staged recovery");
        self.audit.record(
            "recovery",
            Severity::High,
            serde_json::json!({ "stage": "start", "endpoint": self.primary_pool().endpoint() }),
        );

        // Stage 2: recreate the pool at a reduced cap.
        let reduced = (self.cap() / 2).max(self.config.min);
        self.rebuild_primary(reduced).await;

        // Stage 3: validate; when the probe still fails, force-close
        // everything and rebuild at the minimum.
        let ping_timeout = self.config.connect_timeout / 2;
        let mut healthy = self.primary_pool().health_check(ping_timeout).await;
        if !healthy {
            let old = self.primary_pool();
            old.drain(Duration::from_millis(0)).await;
            self.rebuild_primary(self.config.min).await;

            // Stage 4: back off, pre-warm, re-validate.
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.primary_pool().warm(self.config.min).await;
            healthy = self.primary_pool().health_check(ping_timeout).await;
        }

        if healthy {
            // Stage 5: recovered.
            self.primary_pool().breaker().force_close();
            self.counters.recoveries.fetch_add(1, Ordering::Relaxed);
            tracing::info!(component = "pool", "staged recovery succeeded");
            self.audit.record(
                "recovery",
                Severity::High,
                serde_json::json!({ "stage": "recovered", "cap": self.cap() }),
            );
        } else {
            tracing::error!(component = "pool", "staged recovery failed");
            self.audit.record(
                "recovery",
                Severity::Critical,
                serde_json::json!({ "stage": "failed", "endpoint": self.primary_pool().endpoint() }),
            );
        }
        self.recovery_in_progress.store(false, Ordering::Release);
    }

    /// Scan every endpoint for leaked borrows.
    pub fn leak_cycle(&self) {
        let mut pools = vec![self.primary_pool()];
        pools.extend(self.replicas.iter().cloned());
        for pool in pools {
            for leak in pool.scan_leaks(self.config.leak_threshold) {
                tracing::warn!(
                    component = "pool",
                    connection = %leak.connection_id,
                    endpoint = %leak.endpoint,
                    age_ms = leak.age_ms,
                    tag = leak.tag.as_deref().unwrap_or("-"),
                    "leaked connection force-released"
                );
                self.audit.record(
                    "connection-leak",
                    Severity::Medium,
                    serde_json::json!({
                        "connection": leak.connection_id,
                        "endpoint": leak.endpoint,
                        "age_ms": leak.age_ms,
                        "tag": leak.tag,
                        "acquire_site": leak.acquire_site,
                    }),
                );
            }
        }

        let total_leaks = self.counters.leaks_detected.load(Ordering::Relaxed);
        if total_leaks >= LEAK_ALERT_THRESHOLD
            && !self.leak_alert_raised.swap(true, Ordering::AcqRel)
        {
            self.audit.record(
                "connection-leak-threshold",
                Severity::Critical,
                serde_json::json!({ "total_leaks": total_leaks }),
            );
        }
    }

    /// Write the stats file; failures are logged and swallowed.
    pub fn persist_stats(&self) {
        let Some(path) = &self.config.stats_path else {
            return;
        };
        let primary = self.primary_pool();
        let stats = PoolStatsFile::new(
            &self.config.db_name,
            self.counters.snapshot(),
            self.cap(),
            primary.recent_waits_ms(),
            primary.health_failures(),
            primary.last_health_check().map(|_| crate::common::now_rfc3339()),
        );
        if let Err(err) = save_stats(path, &stats) {
            tracing::warn!(component = "pool", error = %err, "failed to persist pool stats");
        }
    }

    pub fn snapshot(&self) -> SessionManagerSnapshot {
        SessionManagerSnapshot {
            cap: self.cap(),
            primary: self.primary_pool().snapshot(),
            replicas: self.replicas.iter().map(|r| r.snapshot()).collect(),
            stats: self.counters.snapshot(),
        }
    }

    /// Stop background loops, persist final stats and drain all pools.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.persist_stats();
        self.primary_pool().drain(self.config.drain_timeout).await;
        for replica in &self.replicas {
            replica.drain(self.config.drain_timeout).await;
        }
    }
}

impl PressureSubscriber for SessionManager {
    fn name(&self) -> &'static str {
        "session-manager"
    }

    fn on_pressure(&self, update: PressureUpdate) -> Result<()> {
        self.load_bits
            .store(update.pressure.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }
}
