// # Endpoint Pool
//
// The pool for one database endpoint (primary or replica). Capacity is
// fixed per incarnation; dynamic resizing swaps in a freshly built
// pool (double-buffered) at the session-manager level. No I/O happens
// under the pool locks.

use super::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use super::connection::{ConnectionHandle, IdleConn, InUseInfo};
use super::stats::PoolCounters;
use crate::backend::{Connection, Connector};
use crate::common::new_id;
use crate::error::{GatewayError, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Recent acquire wait samples retained for resize decisions.
const WAIT_RING_CAPACITY: usize = 64;

/// Tuning for one pool incarnation.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub cap: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub breaker: BreakerConfig,
}

/// Live-view numbers for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub endpoint: String,
    pub read_only: bool,
    pub cap: usize,
    pub idle: usize,
    pub in_use: usize,
    pub healthy: bool,
    pub breaker: CircuitState,
    pub health_failures: u32,
    pub avg_wait_ms: u64,
}

/// A leaked borrow found by the leak detector.
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    pub connection_id: String,
    pub endpoint: String,
    pub age_ms: u64,
    pub tag: Option<String>,
    pub acquire_site: String,
}

pub struct EndpointPool {
    endpoint: String,
    read_only: bool,
    connector: Arc<dyn Connector>,
    config: EndpointConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn>>,
    in_use: Mutex<HashMap<String, InUseInfo>>,
    wait_ring: Mutex<VecDeque<Duration>>,
    draining: AtomicBool,
    healthy: AtomicBool,
    health_in_progress: AtomicBool,
    health_failures: AtomicU32,
    last_health_check: RwLock<Option<Instant>>,
    breaker: CircuitBreaker,
    counters: Arc<PoolCounters>,
}

impl EndpointPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: EndpointConfig,
        counters: Arc<PoolCounters>,
    ) -> Arc<Self> {
        let endpoint = connector.endpoint();
        let read_only = connector.read_only();
        Arc::new(Self {
            breaker: CircuitBreaker::new(endpoint.clone(), config.breaker.clone()),
            semaphore: Arc::new(Semaphore::new(config.cap.max(1))),
            idle: Mutex::new(Vec::new()),
            in_use: Mutex::new(HashMap::new()),
            wait_ring: Mutex::new(VecDeque::with_capacity(WAIT_RING_CAPACITY)),
            draining: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            health_in_progress: AtomicBool::new(false),
            health_failures: AtomicU32::new(0),
            last_health_check: RwLock::new(None),
            endpoint,
            read_only,
            connector,
            config,
            counters,
        })
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn cap(&self) -> usize {
        self.config.cap
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn health_failures(&self) -> u32 {
        self.health_failures.load(Ordering::Relaxed)
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        *self.last_health_check.read()
    }

    /// Pre-create up to `count` idle connections; individual failures
    /// are logged, not fatal.
    pub async fn warm(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            match self.connector.connect().await {
                Ok(conn) => {
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    self.idle.lock().push(IdleConn {
                        id: new_id(),
                        conn,
                        created_at: now,
                        idled_at: now,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        component = "pool",
                        endpoint = %self.endpoint,
                        error = %err,
                        "warm-up connection failed"
                    );
                    break;
                }
            }
        }
    }

    /// Borrow a connection: breaker gate, bounded wait for capacity,
    /// idle reuse, create on demand.
    pub async fn acquire(self: &Arc<Self>, tag: Option<String>) -> Result<ConnectionHandle> {
        if self.draining.load(Ordering::Acquire) {
            return Err(GatewayError::ResourceExhausted(format!(
                "pool {} is draining",
                self.endpoint
            )));
        }
        self.breaker.allow_request()?;

        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(GatewayError::ResourceExhausted(format!(
                    "pool {} is closed",
                    self.endpoint
                )));
            }
            Err(_elapsed) => {
                self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                self.record_wait(started.elapsed());
                return Err(GatewayError::Timeout(format!(
                    "timed out acquiring connection to {} after {:?}",
                    self.endpoint, self.config.acquire_timeout
                )));
            }
        };

        let (id, conn, created_at) = match self.take_idle() {
            Some(idle) => (idle.id, idle.conn, idle.created_at),
            None => {
                let conn = match self.connector.connect().await {
                    Ok(conn) => {
                        self.breaker.on_success();
                        self.counters.created.fetch_add(1, Ordering::Relaxed);
                        conn
                    }
                    Err(err) => {
                        self.breaker.on_failure();
                        return Err(err);
                    }
                };
                (new_id(), conn, Instant::now())
            }
        };

        self.record_wait(started.elapsed());
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        self.in_use
            .lock()
            .insert(id.clone(), InUseInfo::new(id.clone(), tag));

        Ok(ConnectionHandle::new(
            id,
            conn,
            created_at,
            Arc::clone(self),
            permit,
        ))
    }

    /// Pop a live idle connection, closing any that idled out.
    fn take_idle(&self) -> Option<IdleConn> {
        let mut idle = self.idle.lock();
        while let Some(candidate) = idle.pop() {
            if candidate.idled_at.elapsed() > self.config.idle_timeout {
                self.counters.closed.fetch_add(1, Ordering::Relaxed);
                spawn_close(candidate.conn);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// Accept a returned connection. Exactly-once release is enforced
    /// by the handle; a missing tracking entry means the leak detector
    /// force-released this borrow and the connection just closes.
    pub(super) fn give_back(
        &self,
        id: &str,
        conn: Box<dyn Connection>,
        created_at: Instant,
        broken: bool,
    ) {
        let tracked = self.in_use.lock().remove(id).is_some();
        if !tracked {
            tracing::debug!(
                component = "pool",
                connection = id,
                "returning connection already force-released; closing"
            );
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            spawn_close(conn);
            return;
        }
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        if broken || self.draining.load(Ordering::Acquire) {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            spawn_close(conn);
            return;
        }
        self.idle.lock().push(IdleConn {
            id: id.to_string(),
            conn,
            created_at,
            idled_at: Instant::now(),
        });
    }

    pub(super) fn note_double_release(&self) {
        self.counters.double_releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Best-effort server-side kill via a side channel.
    pub async fn kill(&self, thread_id: u32) -> Result<()> {
        self.connector.kill(thread_id).await
    }

    /// One background liveness probe with a strict timeout. Concurrent
    /// probes are suppressed; returns the probe outcome.
    pub async fn health_check(self: &Arc<Self>, ping_timeout: Duration) -> bool {
        if self
            .health_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.is_healthy();
        }
        let outcome = self.run_probe(ping_timeout).await;
        *self.last_health_check.write() = Some(Instant::now());
        if outcome {
            self.health_failures.store(0, Ordering::Relaxed);
            self.healthy.store(true, Ordering::Relaxed);
            self.breaker.on_success();
        } else {
            self.health_failures.fetch_add(1, Ordering::Relaxed);
            self.counters
                .health_failures_total
                .fetch_add(1, Ordering::Relaxed);
            self.healthy.store(false, Ordering::Relaxed);
            self.breaker.on_failure();
        }
        self.health_in_progress.store(false, Ordering::Release);
        outcome
    }

    async fn run_probe(&self, ping_timeout: Duration) -> bool {
        // Prefer an idle connection; otherwise probe a fresh one.
        if let Some(mut idle) = self.take_idle() {
            match tokio::time::timeout(ping_timeout, idle.conn.ping()).await {
                Ok(Ok(())) => {
                    idle.idled_at = Instant::now();
                    self.idle.lock().push(idle);
                    return true;
                }
                Ok(Err(err)) => {
                    tracing::warn!(component = "pool", endpoint = %self.endpoint, error = %err, "health ping failed");
                    self.counters.closed.fetch_add(1, Ordering::Relaxed);
                    spawn_close(idle.conn);
                    return false;
                }
                Err(_elapsed) => {
                    tracing::warn!(component = "pool", endpoint = %self.endpoint, "health ping timed out");
                    self.counters.closed.fetch_add(1, Ordering::Relaxed);
                    spawn_close(idle.conn);
                    return false;
                }
            }
        }

        match tokio::time::timeout(ping_timeout, self.connector.connect()).await {
            Ok(Ok(mut conn)) => match tokio::time::timeout(ping_timeout, conn.ping()).await {
                Ok(Ok(())) => {
                    // Keep the probe connection only while it fits the cap.
                    if self.idle_count() + self.in_use_count() < self.config.cap {
                        let now = Instant::now();
                        self.counters.created.fetch_add(1, Ordering::Relaxed);
                        self.idle.lock().push(IdleConn {
                            id: new_id(),
                            conn,
                            created_at: now,
                            idled_at: now,
                        });
                    } else {
                        spawn_close(conn);
                    }
                    true
                }
                _ => {
                    spawn_close(conn);
                    false
                }
            },
            Ok(Err(err)) => {
                tracing::warn!(component = "pool", endpoint = %self.endpoint, error = %err, "health connect failed");
                false
            }
            Err(_elapsed) => {
                tracing::warn!(component = "pool", endpoint = %self.endpoint, "health connect timed out");
                false
            }
        }
    }

    /// Find and forcibly release borrows older than `threshold`.
    pub fn scan_leaks(&self, threshold: Duration) -> Vec<LeakReport> {
        let mut reports = Vec::new();
        let mut in_use = self.in_use.lock();
        let leaked: Vec<String> = in_use
            .iter()
            .filter(|(_, info)| info.acquired_at.elapsed() > threshold)
            .map(|(id, _)| id.clone())
            .collect();
        for id in leaked {
            if let Some(info) = in_use.remove(&id) {
                self.counters.leaks_detected.fetch_add(1, Ordering::Relaxed);
                self.counters.forced_releases.fetch_add(1, Ordering::Relaxed);
                reports.push(LeakReport {
                    connection_id: id,
                    endpoint: self.endpoint.clone(),
                    age_ms: info.acquired_at.elapsed().as_millis() as u64,
                    tag: info.tag,
                    acquire_site: info.acquire_site,
                });
            }
        }
        reports
    }

    /// Stop handing out connections and close idle ones; waits up to
    /// `timeout` for borrows to come home.
    pub async fn drain(&self, timeout: Duration) {
        self.draining.store(true, Ordering::Release);
        let idle: Vec<IdleConn> = self.idle.lock().drain(..).collect();
        for conn in idle {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            spawn_close(conn.conn);
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.in_use.lock().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let abandoned = {
            let mut in_use = self.in_use.lock();
            let count = in_use.len();
            in_use.clear();
            count
        };
        if abandoned > 0 {
            tracing::warn!(
                component = "pool",
                endpoint = %self.endpoint,
                abandoned,
                "drain timeout; abandoned in-use connections will close on release"
            );
        }
    }

    pub fn record_wait(&self, wait: Duration) {
        let mut ring = self.wait_ring.lock();
        if ring.len() >= WAIT_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(wait);
    }

    /// (average, rising) over the recent wait samples. `rising` compares
    /// the newer half against the older half.
    pub fn wait_profile(&self) -> (Duration, bool) {
        let ring = self.wait_ring.lock();
        if ring.is_empty() {
            return (Duration::ZERO, false);
        }
        let total: Duration = ring.iter().sum();
        let avg = total / ring.len() as u32;
        if ring.len() < 4 {
            return (avg, false);
        }
        let half = ring.len() / 2;
        let older: Duration = ring.iter().take(half).sum();
        let newer: Duration = ring.iter().skip(half).sum();
        let older_avg = older / half as u32;
        let newer_avg = newer / (ring.len() - half) as u32;
        (avg, newer_avg > older_avg)
    }

    pub fn recent_waits_ms(&self) -> Vec<u64> {
        self.wait_ring
            .lock()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().len()
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let (avg_wait, _) = self.wait_profile();
        EndpointSnapshot {
            endpoint: self.endpoint.clone(),
            read_only: self.read_only,
            cap: self.config.cap,
            idle: self.idle_count(),
            in_use: self.in_use_count(),
            healthy: self.is_healthy(),
            breaker: self.breaker.state(),
            health_failures: self.health_failures(),
            avg_wait_ms: avg_wait.as_millis() as u64,
        }
    }
}

/// Close a connection off the caller's path. Falls back to dropping
/// the handle when no runtime is available (tests on plain threads).
fn spawn_close(conn: Box<dyn Connection>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(err) = conn.close().await {
                tracing::debug!(component = "pool", error = %err, "connection close failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockConnector, MockState};

    fn pool_with(cap: usize, state: Arc<MockState>) -> Arc<EndpointPool> {
        let connector = Arc::new(MockConnector::new("mock-primary", false, state));
        EndpointPool::new(
            connector,
            EndpointConfig {
                cap,
                acquire_timeout: Duration::from_millis(100),
                idle_timeout: Duration::from_secs(60),
                breaker: BreakerConfig::default(),
            },
            Arc::new(PoolCounters::default()),
        )
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let state = MockState::new();
        let pool = pool_with(2, Arc::clone(&state));

        let handle = pool.acquire(None).await.unwrap();
        assert_eq!(pool.in_use_count(), 1);
        handle.release();
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.idle_count(), 1);

        let _again = pool.acquire(None).await.unwrap();
        // Second acquire reuses the idle connection.
        assert_eq!(state.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_cap() {
        let state = MockState::new();
        let pool = pool_with(2, state);

        let h1 = pool.acquire(None).await.unwrap();
        let h2 = pool.acquire(None).await.unwrap();
        assert_eq!(pool.in_use_count() + pool.idle_count(), 2);

        // Third acquire must time out at the bounded wait.
        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));

        drop(h1);
        drop(h2);
        // Capacity freed; acquisition works again.
        let h3 = pool.acquire(None).await.unwrap();
        assert_eq!(pool.in_use_count(), 1);
        drop(h3);
    }

    #[tokio::test]
    async fn test_broken_connection_not_reused() {
        let state = MockState::new();
        let pool = pool_with(2, Arc::clone(&state));

        let mut handle = pool.acquire(None).await.unwrap();
        handle.mark_broken();
        drop(handle);
        assert_eq!(pool.idle_count(), 0);

        let _next = pool.acquire(None).await.unwrap();
        assert_eq!(state.connects.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_ping_failures_and_fails_fast() {
        let state = MockState::new();
        let pool = pool_with(2, Arc::clone(&state));
        state.fail_ping.store(true, std::sync::atomic::Ordering::SeqCst);

        for _ in 0..5 {
            assert!(!pool.health_check(Duration::from_millis(50)).await);
        }
        assert_eq!(pool.breaker().state(), CircuitState::Open);
        assert_eq!(pool.health_failures(), 5);

        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn test_health_check_suppresses_concurrent_probes() {
        let state = MockState::new();
        let pool = pool_with(2, Arc::clone(&state));
        // Two sequential checks probe twice; the suppression flag only
        // guards overlapping probes.
        assert!(pool.health_check(Duration::from_millis(50)).await);
        assert!(pool.health_check(Duration::from_millis(50)).await);
        assert!(state.pings.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_leak_scan_force_releases_old_borrows() {
        let state = MockState::new();
        let pool = pool_with(2, state);

        let handle = pool.acquire(Some("leaky-op".into())).await.unwrap();
        let reports = pool.scan_leaks(Duration::from_millis(0));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].tag.as_deref(), Some("leaky-op"));
        assert_eq!(pool.in_use_count(), 0);

        // The late release closes the connection instead of pooling it.
        drop(handle);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_closes_idle_and_rejects_acquires() {
        let state = MockState::new();
        let pool = pool_with(2, state);
        let handle = pool.acquire(None).await.unwrap();
        handle.release();
        assert_eq!(pool.idle_count(), 1);

        pool.drain(Duration::from_millis(100)).await;
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.acquire(None).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_profile_trend() {
        let state = MockState::new();
        let pool = pool_with(2, state);
        for ms in [1u64, 1, 1, 1, 40, 40, 40, 40] {
            pool.record_wait(Duration::from_millis(ms));
        }
        let (avg, rising) = pool.wait_profile();
        assert!(rising);
        assert!(avg >= Duration::from_millis(10));
    }
}
