// # Smart Retry
//
// Runs an operation under a retry policy, classifying each failure and
// re-attempting only the transient categories. Backoff is exponential
// with a cap and optional uniform(0.5, 1.5) jitter. Exhaustion wraps
// the last error as `retry-exhausted` carrying the cause.

use crate::error::{GatewayError, Result};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Retry tuning; `max_attempts` counts the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Who and what is being retried; carried into logs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryContext {
    pub session: Option<String>,
    pub user: Option<String>,
    pub operation: String,
}

impl RetryContext {
    pub fn for_operation(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }
}

/// What the driver observed, alongside the final result.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub attempts: u32,
    pub total_delay: Duration,
    pub result: Result<T>,
}

impl<T> RetryOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Pre-jitter backoff for a given attempt (1-based), capped.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.multiplier.powi(attempt.saturating_sub(1) as i32);
    let raw = policy.base_delay.as_secs_f64() * exp;
    Duration::from_secs_f64(raw.min(policy.max_delay.as_secs_f64()))
}

/// The retry driver. Stateless; safe to share.
#[derive(Debug, Clone, Default)]
pub struct SmartRetry {
    policy: RetryPolicy,
}

impl SmartRetry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run
    /// out. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, context: &RetryContext, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut total_delay = Duration::ZERO;
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            component = "retry",
                            operation = %context.operation,
                            attempt,
                            "operation recovered after retry"
                        );
                    }
                    return RetryOutcome {
                        attempts: attempt,
                        total_delay,
                        result: Ok(value),
                    };
                }
                Err(err) if !err.is_retryable() => {
                    return RetryOutcome {
                        attempts: attempt,
                        total_delay,
                        result: Err(err),
                    };
                }
                Err(err) if attempt == max_attempts => {
                    tracing::warn!(
                        component = "retry",
                        operation = %context.operation,
                        attempts = attempt,
                        category = err.category(),
                        "retries exhausted"
                    );
                    return RetryOutcome {
                        attempts: attempt,
                        total_delay,
                        result: Err(GatewayError::RetryExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        }),
                    };
                }
                Err(err) => {
                    let mut delay = backoff_delay(&self.policy, attempt);
                    if self.policy.jitter {
                        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
                        delay = Duration::from_secs_f64(delay.as_secs_f64() * factor);
                    }
                    tracing::debug!(
                        component = "retry",
                        operation = %context.operation,
                        attempt,
                        category = err.category(),
                        delay_ms = delay.as_millis() as u64,
                        "transient failure; backing off"
                    );
                    total_delay += delay;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!("loop returns on every path")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let retry = SmartRetry::new(fast_policy());
        let ctx = RetryContext::for_operation("noop");
        let outcome = retry.run(&ctx, |_| async { Ok::<_, GatewayError>(7) }).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.total_delay, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_deadlock_retried_then_succeeds() {
        let retry = SmartRetry::new(fast_policy());
        let ctx = RetryContext::for_operation("exec");
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = retry
            .run(&ctx, |_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(GatewayError::Deadlock("first attempt".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.total_delay > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let retry = SmartRetry::new(fast_policy());
        let ctx = RetryContext::for_operation("exec");
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: RetryOutcome<()> = retry
            .run(&ctx, |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Syntax("bad sql".into()))
                }
            })
            .await;
        assert!(!outcome.succeeded());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome.result, Err(GatewayError::Syntax(_))));
    }

    #[tokio::test]
    async fn test_security_violation_never_retried() {
        let retry = SmartRetry::new(fast_policy());
        let ctx = RetryContext::for_operation("exec");
        let outcome: RetryOutcome<()> = retry
            .run(&ctx, |_| async {
                Err(GatewayError::SecurityViolation {
                    message: "blocked".into(),
                    severity: crate::error::Severity::High,
                })
            })
            .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_cause() {
        let retry = SmartRetry::new(fast_policy());
        let ctx = RetryContext::for_operation("exec");
        let outcome: RetryOutcome<()> = retry
            .run(&ctx, |_| async { Err(GatewayError::Connection("down".into())) })
            .await;
        assert_eq!(outcome.attempts, 3);
        match outcome.result {
            Err(GatewayError::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, GatewayError::Connection(_)));
            }
            other => panic!("expected retry-exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_sequence_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(400));
        // Capped from here on.
        assert_eq!(backoff_delay(&policy, 4), Duration::from_millis(400));
        assert_eq!(backoff_delay(&policy, 8), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_total_delay_bounded_by_cap_sum() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(8),
            multiplier: 2.0,
            jitter: false,
        };
        let retry = SmartRetry::new(policy.clone());
        let ctx = RetryContext::for_operation("exec");
        let outcome: RetryOutcome<()> = retry
            .run(&ctx, |_| async { Err(GatewayError::Timeout("t".into())) })
            .await;
        let cap_sum: Duration = (1..policy.max_attempts)
            .map(|a| backoff_delay(&policy, a))
            .sum();
        assert!(outcome.total_delay <= cap_sum);
    }
}
