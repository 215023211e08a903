// # Memory Pressure Controller
//
// Samples process memory on an interval, maintains a bounded history
// ring, and publishes a pressure scalar in [0, 1] to registered
// subscribers (pool and cache). Subscriber callbacks run in parallel;
// individual failures are logged, never propagated. Extreme pressure
// (> 0.95) triggers an emergency pass that clears tracked state and
// raises a critical alert.

use super::{leak_suspected, MemorySnapshot, ObjectRegistry, DEFAULT_CLEANUP_IDLE};
use crate::audit::AuditSink;
use crate::config::MemoryConfig;
use crate::error::{Result, Severity};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Pressure above which the emergency pass runs.
const EMERGENCY_PRESSURE: f64 = 0.95;

/// What subscribers receive after every sample.
#[derive(Debug, Clone)]
pub struct PressureUpdate {
    pub pressure: f64,
    pub leak_suspected: bool,
    pub rss: u64,
}

/// Implemented by the pool and the cache manager to react to pressure.
pub trait PressureSubscriber: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_pressure(&self, update: PressureUpdate) -> Result<()>;
}

/// Samples memory, detects leak-shaped growth, and fans updates out.
pub struct PressureController {
    config: MemoryConfig,
    system_ref: u64,
    history: RwLock<VecDeque<MemorySnapshot>>,
    subscribers: RwLock<Vec<Arc<dyn PressureSubscriber>>>,
    registry: Arc<ObjectRegistry>,
    audit: Arc<AuditSink>,
    sampler: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    samples_taken: AtomicU64,
    emergencies: AtomicU64,
}

impl PressureController {
    pub fn new(config: MemoryConfig, audit: Arc<AuditSink>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            system_ref: super::system_reference(),
            history: RwLock::new(VecDeque::with_capacity(config.history_size)),
            subscribers: RwLock::new(Vec::new()),
            registry: Arc::new(ObjectRegistry::new()),
            audit,
            sampler: Mutex::new(None),
            shutdown,
            samples_taken: AtomicU64::new(0),
            emergencies: AtomicU64::new(0),
            config,
        }
    }

    /// Register a subscriber; it is called after every sample.
    pub fn subscribe(&self, subscriber: Arc<dyn PressureSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn registry(&self) -> Arc<ObjectRegistry> {
        Arc::clone(&self.registry)
    }

    /// Latest published pressure, 0.0 before the first sample.
    pub fn current_pressure(&self) -> f64 {
        self.history.read().back().map(|s| s.pressure).unwrap_or(0.0)
    }

    pub fn latest(&self) -> Option<MemorySnapshot> {
        self.history.read().back().cloned()
    }

    pub fn history(&self) -> Vec<MemorySnapshot> {
        self.history.read().iter().cloned().collect()
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken.load(Ordering::Relaxed)
    }

    /// Take one sample immediately and publish it.
    pub fn sample_now(self: &Arc<Self>) {
        let snapshot = MemorySnapshot::collect(self.system_ref);
        self.ingest(snapshot);
    }

    /// Publish a pre-built snapshot; the test and replay entry point.
    pub(crate) fn ingest(self: &Arc<Self>, mut snapshot: MemorySnapshot) {
        {
            let mut history = self.history.write();
            let heap_series: Vec<u64> = history
                .iter()
                .map(|s| s.heap_used)
                .chain(std::iter::once(snapshot.heap_used))
                .collect();
            snapshot.leak_suspected = leak_suspected(&heap_series);
            if history.len() >= self.config.history_size.max(1) {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }
        self.samples_taken.fetch_add(1, Ordering::Relaxed);

        if snapshot.leak_suspected {
            tracing::warn!(
                component = "memory",
                rss = snapshot.rss,
                "heap growth matches leak heuristic"
            );
            self.audit.record(
                "memory-leak-suspected",
                Severity::High,
                serde_json::json!({ "rss": snapshot.rss, "pressure": snapshot.pressure }),
            );
        }

        if self.config.auto_gc {
            let report = self.registry.cleanup(DEFAULT_CLEANUP_IDLE);
            if report.dead + report.idle > 0 {
                tracing::debug!(
                    component = "memory",
                    dead = report.dead,
                    idle = report.idle,
                    "object registry cleanup"
                );
            }
        }

        if snapshot.pressure > EMERGENCY_PRESSURE {
            self.emergency(&snapshot);
        }

        self.fan_out(PressureUpdate {
            pressure: snapshot.pressure,
            leak_suspected: snapshot.leak_suspected,
            rss: snapshot.rss,
        });
    }

    /// Notify all subscribers. Runs them in parallel when a runtime is
    /// available; failures are logged and swallowed.
    fn fan_out(&self, update: PressureUpdate) {
        let subscribers: Vec<Arc<dyn PressureSubscriber>> =
            self.subscribers.read().iter().cloned().collect();
        let spawnable = tokio::runtime::Handle::try_current().is_ok();
        for subscriber in subscribers {
            let update = update.clone();
            let call = move || {
                if let Err(err) = subscriber.on_pressure(update) {
                    tracing::warn!(
                        component = "memory",
                        subscriber = subscriber.name(),
                        error = %err,
                        "pressure subscriber failed"
                    );
                }
            };
            if spawnable {
                tokio::spawn(async move { call() });
            } else {
                call();
            }
        }
    }

    fn emergency(&self, snapshot: &MemorySnapshot) {
        self.emergencies.fetch_add(1, Ordering::Relaxed);
        let cleared = self.registry.clear();
        self.history.write().clear();
        tracing::error!(
            component = "memory",
            pressure = snapshot.pressure,
            cleared_objects = cleared,
            "extreme memory pressure: emergency cleanup"
        );
        self.audit.record(
            "memory-emergency",
            Severity::Critical,
            serde_json::json!({
                "pressure": snapshot.pressure,
                "rss": snapshot.rss,
                "cleared_objects": cleared,
            }),
        );
    }

    /// Spawn the background sampler. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.sampler.lock();
        if slot.is_some() {
            return;
        }
        let controller = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.monitoring_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => controller.sample_now(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(component = "memory", "pressure sampler stopped");
        }));
    }

    /// Stop the sampler and wait for it to exit.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.sampler.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
