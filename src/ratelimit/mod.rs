// # Adaptive Rate Limiter
//
// Token bucket per caller identifier. Refill rate is `max / window`;
// bucket capacity contracts with system load published by the memory
// controller, floored at 10% of the configured maximum. Rejections are
// recorded as security events with the observed count and limit.

use crate::audit::AuditSink;
use crate::config::SecurityConfig;
use crate::error::{GatewayError, Result, Severity};
use crate::memory::{PressureSubscriber, PressureUpdate};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Capacity never contracts below this share of the configured max.
const CAPACITY_FLOOR: f64 = 0.1;

/// Identifier used when the caller supplies none.
pub const GLOBAL_IDENTIFIER: &str = "global";

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Counters surfaced in diagnostics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RateLimiterStats {
    pub admitted: u64,
    pub rejected: u64,
    pub refunded: u64,
    pub active_buckets: usize,
}

/// Load-aware token-bucket limiter keyed by identifier.
pub struct AdaptiveRateLimiter {
    max: u64,
    window: Duration,
    buckets: DashMap<String, Bucket>,
    /// Current system load in [0, 1], stored as f64 bits.
    load_bits: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    refunded: AtomicU64,
    audit: Arc<AuditSink>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: &SecurityConfig, audit: Arc<AuditSink>) -> Self {
        Self {
            max: config.rate_limit_max,
            window: config.rate_limit_window,
            buckets: DashMap::new(),
            load_bits: AtomicU64::new(0f64.to_bits()),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            refunded: AtomicU64::new(0),
            audit,
        }
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    /// Effective bucket capacity under the current load.
    fn capacity(&self) -> f64 {
        let scale = (1.0 - self.load()).max(CAPACITY_FLOOR);
        (self.max as f64 * scale).max(1.0)
    }

    fn refill_rate(&self) -> f64 {
        self.max as f64 / self.window.as_secs_f64().max(f64::EPSILON)
    }

    /// Admit or reject one request for `identifier`.
    pub fn check(&self, identifier: &str) -> Result<()> {
        let capacity = self.capacity();
        let rate = self.refill_rate();
        let now = Instant::now();

        let mut bucket = self
            .buckets
            .entry(identifier.to_string())
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let current = (capacity - bucket.tokens).round() as u64;
        let limit = capacity.round() as u64;
        drop(bucket);

        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.audit.security_event(
            "rate-limited",
            Severity::Low,
            serde_json::json!({ "identifier": identifier, "current": current, "limit": limit }),
        );
        tracing::debug!(
            component = "ratelimit",
            identifier,
            current,
            limit,
            "request rejected by rate limiter"
        );
        Err(GatewayError::RateLimited {
            identifier: identifier.to_string(),
            current,
            limit,
        })
    }

    /// Return a token to `identifier`, used when an admitted request is
    /// rejected before it reaches the database.
    pub fn refund(&self, identifier: &str) {
        let capacity = self.capacity();
        if let Some(mut bucket) = self.buckets.get_mut(identifier) {
            bucket.tokens = (bucket.tokens + 1.0).min(capacity);
            self.refunded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Update the load coefficient; capacity shrinks as load rises.
    pub fn set_system_load(&self, load: f64) {
        let clamped = load.clamp(0.0, 1.0);
        self.load_bits.store(clamped.to_bits(), Ordering::Relaxed);
        // Existing buckets shed excess tokens on their next refill,
        // since refill clamps to the reduced capacity.
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            refunded: self.refunded.load(Ordering::Relaxed),
            active_buckets: self.buckets.len(),
        }
    }
}

impl PressureSubscriber for AdaptiveRateLimiter {
    fn name(&self) -> &'static str {
        "rate-limiter"
    }

    fn on_pressure(&self, update: PressureUpdate) -> Result<()> {
        self.set_system_load(update.pressure);
        Ok(())
    }
}
