// # Gateway Error Taxonomy
//
// Central error type for the gateway core plus the classification
// machinery the retry driver and the user-facing surface depend on.
// Every surfaced error carries a category, a severity, a retryability
// flag and static recovery hints.

use serde::Serialize;
use thiserror::Error;

/// Severity attached to every error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Classification tag used by the retry driver to decide whether an
/// error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    AccessDenied,
    ObjectNotFound,
    Constraint,
    Syntax,
    Connection,
    Deadlock,
    LockTimeout,
    Timeout,
    TransientNet,
    ResourceExhausted,
    CircuitOpen,
    Security,
    Unknown,
}

impl ErrorClass {
    /// Transient classes the retry driver is allowed to re-attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::TransientNet
                | ErrorClass::Deadlock
                | ErrorClass::LockTimeout
                | ErrorClass::Connection
                | ErrorClass::Timeout
        )
    }
}

/// Gateway-wide error type covering the full taxonomy.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Security violation: {message}")]
    SecurityViolation { message: String, severity: Severity },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    #[error("Lock wait timeout: {0}")]
    LockWaitTimeout(String),

    #[error("Query interrupted: {0}")]
    QueryInterrupted(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Rate limit exceeded for {identifier}: {current}/{limit} in window")]
    RateLimited {
        identifier: String,
        current: u64,
        limit: u64,
    },

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<GatewayError>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl GatewayError {
    /// Stable kebab-case category string for logs and the wire surface.
    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::SecurityViolation { .. } => "security-violation",
            GatewayError::Validation(_) => "validation-error",
            GatewayError::AccessDenied(_) => "access-denied",
            GatewayError::ObjectNotFound(_) => "object-not-found",
            GatewayError::ConstraintViolation(_) => "constraint-violation",
            GatewayError::Syntax(_) => "syntax-error",
            GatewayError::Connection(_) => "connection-error",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Deadlock(_) => "deadlock",
            GatewayError::LockWaitTimeout(_) => "lock-wait-timeout",
            GatewayError::QueryInterrupted(_) => "query-interrupted",
            GatewayError::TransientNetwork(_) => "transient-network",
            GatewayError::ResourceExhausted(_) => "resource-exhausted",
            GatewayError::RateLimited { .. } => "rate-limited",
            GatewayError::CircuitOpen(_) => "circuit-open",
            GatewayError::RetryExhausted { .. } => "retry-exhausted",
            GatewayError::Configuration(_) => "configuration-error",
            GatewayError::Unknown(_) => "unknown",
        }
    }

    /// Classification tag for the retry driver.
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::SecurityViolation { .. } => ErrorClass::Security,
            GatewayError::Validation(_) => ErrorClass::Security,
            GatewayError::AccessDenied(_) => ErrorClass::AccessDenied,
            GatewayError::ObjectNotFound(_) => ErrorClass::ObjectNotFound,
            GatewayError::ConstraintViolation(_) => ErrorClass::Constraint,
            GatewayError::Syntax(_) => ErrorClass::Syntax,
            GatewayError::Connection(_) => ErrorClass::Connection,
            GatewayError::Timeout(_) => ErrorClass::Timeout,
            GatewayError::Deadlock(_) => ErrorClass::Deadlock,
            GatewayError::LockWaitTimeout(_) => ErrorClass::LockTimeout,
            GatewayError::QueryInterrupted(_) => ErrorClass::Timeout,
            GatewayError::TransientNetwork(_) => ErrorClass::TransientNet,
            GatewayError::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            GatewayError::RateLimited { .. } => ErrorClass::ResourceExhausted,
            GatewayError::CircuitOpen(_) => ErrorClass::CircuitOpen,
            GatewayError::RetryExhausted { source, .. } => source.class(),
            GatewayError::Configuration(_) => ErrorClass::Unknown,
            GatewayError::Unknown(_) => ErrorClass::Unknown,
        }
    }

    /// Severity for logging and the alert sink.
    pub fn severity(&self) -> Severity {
        match self {
            GatewayError::SecurityViolation { severity, .. } => *severity,
            GatewayError::Validation(_) => Severity::Low,
            GatewayError::AccessDenied(_) => Severity::High,
            GatewayError::ObjectNotFound(_) => Severity::Low,
            GatewayError::ConstraintViolation(_) => Severity::Medium,
            GatewayError::Syntax(_) => Severity::Low,
            GatewayError::Connection(_) => Severity::High,
            GatewayError::Timeout(_) => Severity::Medium,
            GatewayError::Deadlock(_) => Severity::Medium,
            GatewayError::LockWaitTimeout(_) => Severity::Medium,
            GatewayError::QueryInterrupted(_) => Severity::Low,
            GatewayError::TransientNetwork(_) => Severity::Medium,
            GatewayError::ResourceExhausted(_) => Severity::High,
            GatewayError::RateLimited { .. } => Severity::Low,
            GatewayError::CircuitOpen(_) => Severity::High,
            GatewayError::RetryExhausted { .. } => Severity::High,
            GatewayError::Configuration(_) => Severity::Critical,
            GatewayError::Unknown(_) => Severity::Medium,
        }
    }

    /// Whether the retry driver may re-attempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, GatewayError::RetryExhausted { .. }) {
            return false;
        }
        self.class().is_retryable()
    }

    /// Static recovery hints keyed by category.
    pub fn recovery_hints(&self) -> &'static [&'static str] {
        match self {
            GatewayError::SecurityViolation { .. } => {
                &["review the input for injection patterns", "use parameterized queries"]
            }
            GatewayError::Validation(_) => &["check input types and lengths"],
            GatewayError::AccessDenied(_) => {
                &["verify user privileges", "check the RBAC role assignments"]
            }
            GatewayError::ObjectNotFound(_) => {
                &["verify the table or column name", "refresh the schema cache"]
            }
            GatewayError::ConstraintViolation(_) => {
                &["check unique and foreign key constraints on the affected rows"]
            }
            GatewayError::Syntax(_) => &["review the SQL statement syntax"],
            GatewayError::Connection(_) => {
                &["check database connectivity", "verify host and port configuration"]
            }
            GatewayError::Timeout(_) => {
                &["retry with a smaller result set", "increase the query timeout"]
            }
            GatewayError::Deadlock(_) => {
                &["retry the transaction", "access tables in a consistent order"]
            }
            GatewayError::LockWaitTimeout(_) => {
                &["retry", "consider index tuning to shorten lock windows"]
            }
            GatewayError::QueryInterrupted(_) => &["the query was cancelled; retry if needed"],
            GatewayError::TransientNetwork(_) => &["retry; the network hiccup is likely transient"],
            GatewayError::ResourceExhausted(_) => {
                &["reduce concurrency", "wait for pool capacity to free up"]
            }
            GatewayError::RateLimited { .. } => &["slow down request rate", "retry after the window"],
            GatewayError::CircuitOpen(_) => {
                &["the backend is shedding load; retry after the open window elapses"]
            }
            GatewayError::RetryExhausted { .. } => {
                &["the operation failed repeatedly; inspect the underlying cause"]
            }
            GatewayError::Configuration(_) => &["fix the configuration value and restart"],
            GatewayError::Unknown(_) => &["inspect the server logs"],
        }
    }

    /// Classify a raw MySQL server error into the taxonomy.
    ///
    /// `code` is the server error number (0 when unavailable); message
    /// heuristics cover driver-level failures that carry no code.
    pub fn classify_mysql(code: u16, message: &str) -> GatewayError {
        let msg = message.to_string();
        match code {
            1044 | 1045 | 1142 | 1143 => GatewayError::AccessDenied(msg),
            1046 | 1049 | 1051 | 1054 | 1146 => GatewayError::ObjectNotFound(msg),
            1048 | 1062 | 1169 | 1216 | 1217 | 1451 | 1452 => {
                GatewayError::ConstraintViolation(msg)
            }
            1064 | 1149 => GatewayError::Syntax(msg),
            1040 | 1041 | 1203 => GatewayError::ResourceExhausted(msg),
            1205 => GatewayError::LockWaitTimeout(msg),
            1213 => GatewayError::Deadlock(msg),
            1317 => GatewayError::QueryInterrupted(msg),
            1969 | 3024 => GatewayError::Timeout(msg),
            2002 | 2003 | 2006 | 2013 | 2055 => GatewayError::Connection(msg),
            _ => Self::classify_message(msg),
        }
    }

    fn classify_message(msg: String) -> GatewayError {
        let lower = msg.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            GatewayError::Timeout(msg)
        } else if lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("broken pipe")
            || lower.contains("lost connection")
        {
            GatewayError::TransientNetwork(msg)
        } else if lower.contains("deadlock") {
            GatewayError::Deadlock(msg)
        } else if lower.contains("access denied") {
            GatewayError::AccessDenied(msg)
        } else {
            GatewayError::Unknown(msg)
        }
    }

    /// Build the wire-facing shape, redacting the message first.
    pub fn to_user_facing(&self, redact: impl Fn(&str) -> String) -> UserFacingError {
        UserFacingError {
            category: self.category(),
            severity: self.severity(),
            message: redact(&self.to_string()),
            retryable: self.is_retryable(),
            recovery_hints: self.recovery_hints(),
        }
    }
}

/// The error shape callers see; never contains credentials.
#[derive(Debug, Clone, Serialize)]
pub struct UserFacingError {
    pub category: &'static str,
    pub severity: Severity,
    pub message: String,
    pub retryable: bool,
    pub recovery_hints: &'static [&'static str],
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mysql_code_classification() {
        assert!(matches!(
            GatewayError::classify_mysql(1213, "Deadlock found when trying to get lock"),
            GatewayError::Deadlock(_)
        ));
        assert!(matches!(
            GatewayError::classify_mysql(1045, "Access denied for user"),
            GatewayError::AccessDenied(_)
        ));
        assert!(matches!(
            GatewayError::classify_mysql(1146, "Table 'db.t' doesn't exist"),
            GatewayError::ObjectNotFound(_)
        ));
        assert!(matches!(
            GatewayError::classify_mysql(
                3024,
                "Query execution was interrupted, maximum statement execution time exceeded"
            ),
            GatewayError::Timeout(_)
        ));
    }

    #[test]
    fn test_message_heuristics() {
        assert!(matches!(
            GatewayError::classify_mysql(0, "Connection reset by peer"),
            GatewayError::TransientNetwork(_)
        ));
        assert!(matches!(
            GatewayError::classify_mysql(0, "operation timed out"),
            GatewayError::Timeout(_)
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(GatewayError::Deadlock("d".into()).is_retryable());
        assert!(GatewayError::Connection("c".into()).is_retryable());
        assert!(GatewayError::LockWaitTimeout("l".into()).is_retryable());
        assert!(!GatewayError::Syntax("s".into()).is_retryable());
        assert!(!GatewayError::AccessDenied("a".into()).is_retryable());
        assert!(!GatewayError::SecurityViolation {
            message: "m".into(),
            severity: Severity::High
        }
        .is_retryable());
        let exhausted = GatewayError::RetryExhausted {
            attempts: 3,
            source: Box::new(GatewayError::Deadlock("d".into())),
        };
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn test_user_facing_shape() {
        let err = GatewayError::LockWaitTimeout("lock wait timeout exceeded".into());
        let user = err.to_user_facing(|s| s.to_string());
        assert_eq!(user.category, "lock-wait-timeout");
        assert!(user.retryable);
        assert!(!user.recovery_hints.is_empty());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Info < Severity::Low);
    }
}
