// # Circuit Breaker
//
// Three-state gate (Closed/Open/HalfOpen) around one database
// endpoint. Opens after consecutive failures reach the threshold,
// probes after the open window elapses, and closes again after three
// consecutive probe successes.

use crate::error::{GatewayError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_window: Duration,
    /// Probe budget while half-open.
    pub half_open_max_probes: u32,
    /// Consecutive successes that close a half-open circuit.
    pub close_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_window: Duration::from_secs(30),
            half_open_max_probes: 3,
            close_threshold: 3,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-endpoint circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: RwLock<CircuitState>,
    last_transition: RwLock<Instant>,
    last_failure: RwLock<Option<Instant>>,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    half_open_probes: AtomicU32,
    transitions: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            last_transition: RwLock::new(Instant::now()),
            last_failure: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            half_open_probes: AtomicU32::new(0),
            transitions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        *self.last_failure.read()
    }

    /// Gate a request. Open circuits fail fast until the open window
    /// elapses, then admit a bounded number of half-open probes.
    pub fn allow_request(&self) -> Result<()> {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = self.last_transition.read().elapsed();
                if elapsed >= self.config.open_window {
                    self.transition(CircuitState::HalfOpen);
                    self.half_open_probes.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                } else {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(GatewayError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                let probes = self.half_open_probes.fetch_add(1, Ordering::Relaxed);
                if probes < self.config.half_open_max_probes {
                    Ok(())
                } else {
                    self.half_open_probes.fetch_sub(1, Ordering::Relaxed);
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(GatewayError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    /// Record a successful probe or request.
    pub fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let state = *self.state.read();
        if state == CircuitState::HalfOpen {
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if successes >= self.config.close_threshold {
                self.transition(CircuitState::Closed);
            }
        }
    }

    /// Record a failed probe or request.
    pub fn on_failure(&self) {
        *self.last_failure.write() = Some(Instant::now());
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        let state = *self.state.read();
        match state {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                self.transition(CircuitState::Open);
            }
            // Any half-open failure reopens immediately.
            CircuitState::HalfOpen => self.transition(CircuitState::Open),
            _ => {}
        }
    }

    pub fn force_open(&self) {
        self.transition(CircuitState::Open);
    }

    pub fn force_close(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.transition(CircuitState::Closed);
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn transition(&self, next: CircuitState) {
        let mut state = self.state.write();
        if *state == next {
            return;
        }
        *state = next;
        *self.last_transition.write() = Instant::now();
        self.transitions.fetch_add(1, Ordering::Relaxed);
        match next {
            CircuitState::Open => {
                self.consecutive_successes.store(0, Ordering::Relaxed);
                self.half_open_probes.store(0, Ordering::Relaxed);
                tracing::warn!(component = "pool", breaker = %self.name, "circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes.store(0, Ordering::Relaxed);
                self.half_open_probes.store(0, Ordering::Relaxed);
                tracing::info!(component = "pool", breaker = %self.name, "circuit breaker half-open");
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                tracing::info!(component = "pool", breaker = %self.name, "circuit breaker closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(open_window: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 5,
                open_window,
                half_open_max_probes: 3,
                close_threshold: 3,
            },
        )
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let cb = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.allow_request(),
            Err(GatewayError::CircuitOpen(_))
        ));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            cb.on_failure();
        }
        cb.on_success();
        for _ in 0..4 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_window_then_closes_after_three_successes() {
        let cb = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        // The first request after the window becomes a probe.
        assert!(cb.allow_request().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.on_success();
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request().is_ok());
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_probe_budget() {
        let cb = breaker(Duration::from_millis(10));
        cb.force_open();
        std::thread::sleep(Duration::from_millis(20));
        // Window transition consumes probe #1; two more fit the budget.
        assert!(cb.allow_request().is_ok());
        assert!(cb.allow_request().is_ok());
        assert!(cb.allow_request().is_ok());
        assert!(cb.allow_request().is_err());
    }
}
