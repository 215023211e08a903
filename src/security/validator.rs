// # Input and SQL Validation
//
// Two surfaces share the pattern detector: a generic input validator
// for tool parameters (primitives, arrays, objects) and the SQL
// validator the executor runs before anything touches a connection.
// Every rejection is logged as a security event.

use super::patterns::{PatternDetector, ThreatKind};
use super::QueryVerb;
use crate::audit::AuditSink;
use crate::config::{SecurityConfig, ValidationLevel};
use crate::error::{GatewayError, Result, Severity};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statements may not invoke these server-side file primitives.
const DISALLOWED_OPERATIONS: &[&str] = &["load_file(", "into outfile", "into dumpfile"];

/// Validates tool-call parameter values before they reach the
/// executor. Containers recurse; map keys are validated as strings.
pub struct InputValidator {
    max_input_length: usize,
    level: ValidationLevel,
    detector: Arc<PatternDetector>,
    audit: Arc<AuditSink>,
    validated: AtomicU64,
    rejected: AtomicU64,
}

impl InputValidator {
    pub fn new(config: &SecurityConfig, detector: Arc<PatternDetector>, audit: Arc<AuditSink>) -> Self {
        Self {
            max_input_length: config.max_input_length,
            level: config.validation_level,
            detector,
            audit,
            validated: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Pattern families active for a validation level.
    fn active_kinds(&self) -> Option<&'static [ThreatKind]> {
        match self.level {
            ValidationLevel::Strict => None, // all
            ValidationLevel::Moderate => Some(&[
                ThreatKind::SqlInjection,
                ThreatKind::DangerousOp,
                ThreatKind::PathTraversal,
            ]),
            ValidationLevel::Basic => Some(&[]),
        }
    }

    /// Validate one value tree.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let outcome = self.validate_inner(value, 0);
        match &outcome {
            Ok(()) => {
                self.validated.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.audit.security_event(
                    "input-rejected",
                    err.severity(),
                    serde_json::json!({ "category": err.category() }),
                );
            }
        }
        outcome
    }

    /// Validate a parameter list as the executor receives it.
    pub fn validate_params(&self, params: &[Value]) -> Result<()> {
        for param in params {
            self.validate(param)?;
        }
        Ok(())
    }

    fn validate_inner(&self, value: &Value, depth: usize) -> Result<()> {
        if depth > 16 {
            return Err(GatewayError::Validation(
                "input nesting exceeds supported depth".to_string(),
            ));
        }
        match value {
            Value::String(s) => self.validate_string(s),
            Value::Array(items) => {
                for item in items {
                    self.validate_inner(item, depth + 1)?;
                }
                Ok(())
            }
            Value::Object(map) => {
                for (key, item) in map {
                    self.validate_string(key)?;
                    self.validate_inner(item, depth + 1)?;
                }
                Ok(())
            }
            // Numbers, booleans and null carry no payload to inspect.
            _ => Ok(()),
        }
    }

    fn validate_string(&self, s: &str) -> Result<()> {
        if s.len() > self.max_input_length {
            return Err(GatewayError::Validation(format!(
                "input length {} exceeds maximum {}",
                s.len(),
                self.max_input_length
            )));
        }
        if s.chars().any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r')) {
            return Err(GatewayError::Validation(
                "input contains disallowed control characters".to_string(),
            ));
        }
        let report = self.detector.detect_kinds(s, self.active_kinds());
        if !report.is_clean() {
            let severity = report.max_severity().unwrap_or(Severity::High);
            return Err(GatewayError::SecurityViolation {
                message: format!(
                    "input matched threat patterns: {}",
                    report
                        .matches
                        .iter()
                        .map(|m| m.id)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                severity,
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.validated.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

/// Validates SQL statements: length bound, allow-listed first keyword,
/// no disallowed file operations, no multi-statement separators
/// outside string literals, pattern risk below the threshold.
pub struct SqlValidator {
    max_query_length: usize,
    allowed_verbs: HashSet<String>,
    risk_threshold: u8,
    detector: Arc<PatternDetector>,
    audit: Arc<AuditSink>,
    validated: AtomicU64,
    rejected: AtomicU64,
}

impl SqlValidator {
    pub fn new(config: &SecurityConfig, detector: Arc<PatternDetector>, audit: Arc<AuditSink>) -> Self {
        Self {
            max_query_length: config.max_query_length,
            allowed_verbs: config
                .allowed_query_types
                .iter()
                .map(|v| v.to_uppercase())
                .collect(),
            risk_threshold: config.risk_threshold,
            detector,
            audit,
            validated: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Validate a statement and return its verb for the RBAC step.
    pub fn validate(&self, sql: &str) -> Result<QueryVerb> {
        let outcome = self.validate_inner(sql);
        match &outcome {
            Ok(_) => {
                self.validated.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.audit.security_event(
                    "query-rejected",
                    err.severity(),
                    serde_json::json!({
                        "category": err.category(),
                        "length": sql.len(),
                    }),
                );
                tracing::warn!(
                    component = "security",
                    category = err.category(),
                    "rejected SQL statement"
                );
            }
        }
        outcome
    }

    fn validate_inner(&self, sql: &str) -> Result<QueryVerb> {
        if sql.trim().is_empty() {
            return Err(GatewayError::Validation("empty statement".to_string()));
        }
        if sql.len() > self.max_query_length {
            return Err(GatewayError::Validation(format!(
                "query length {} exceeds maximum {}",
                sql.len(),
                self.max_query_length
            )));
        }

        let verb = QueryVerb::parse(sql).ok_or_else(|| GatewayError::SecurityViolation {
            message: "statement verb is not recognized".to_string(),
            severity: Severity::High,
        })?;
        if !self.allowed_verbs.contains(verb.as_str()) {
            return Err(GatewayError::SecurityViolation {
                message: format!("query type {} is not allowed", verb.as_str()),
                severity: Severity::High,
            });
        }

        let normalized = PatternDetector::normalize(sql);
        for op in DISALLOWED_OPERATIONS {
            if normalized.contains(op) {
                return Err(GatewayError::SecurityViolation {
                    message: format!("disallowed operation: {op}"),
                    severity: Severity::Critical,
                });
            }
        }

        if has_statement_separator(sql) {
            return Err(GatewayError::SecurityViolation {
                message: "multi-statement input is not permitted".to_string(),
                severity: Severity::Critical,
            });
        }

        let report = self.detector.detect(sql);
        if report.risk_score >= self.risk_threshold {
            let severity = report.max_severity().unwrap_or(Severity::High);
            return Err(GatewayError::SecurityViolation {
                message: format!(
                    "statement risk score {} exceeds threshold {}: {}",
                    report.risk_score,
                    self.risk_threshold,
                    report
                        .matches
                        .iter()
                        .map(|m| m.id)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                severity,
            });
        }

        Ok(verb)
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.validated.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

/// True when a `;` appears outside single/double-quoted or backtick
/// literals and is not merely the trailing terminator.
fn has_statement_separator(sql: &str) -> bool {
    let trimmed = sql.trim_end();
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);

    let mut quote: Option<char> = None;
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' && (q == '\'' || q == '"') {
                    chars.next();
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                ';' => return true,
                _ => {}
            },
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detector() -> Arc<PatternDetector> {
        Arc::new(PatternDetector::new())
    }

    fn input_validator(level: ValidationLevel) -> InputValidator {
        let config = SecurityConfig {
            validation_level: level,
            max_input_length: 32,
            ..SecurityConfig::default()
        };
        InputValidator::new(&config, detector(), Arc::new(AuditSink::disabled()))
    }

    fn sql_validator() -> SqlValidator {
        SqlValidator::new(
            &SecurityConfig::default(),
            detector(),
            Arc::new(AuditSink::disabled()),
        )
    }

    #[test]
    fn test_input_length_boundary() {
        let v = input_validator(ValidationLevel::Strict);
        // Exactly max accepts; max + 1 rejects.
        assert!(v.validate(&json!("x".repeat(32))).is_ok());
        assert!(matches!(
            v.validate(&json!("x".repeat(33))),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_control_characters_rejected_except_whitespace() {
        let v = input_validator(ValidationLevel::Strict);
        assert!(v.validate(&json!("line1\nline2\ttab\r")).is_ok());
        assert!(v.validate(&json!("null\u{0}byte")).is_err());
        assert!(v.validate(&json!("bell\u{7}")).is_err());
    }

    #[test]
    fn test_containers_recurse_and_keys_checked() {
        let v = input_validator(ValidationLevel::Strict);
        assert!(v.validate(&json!({"name": ["ok", {"inner": "fine"}]})).is_ok());
        assert!(v.validate(&json!({"k": "1 UNION SELECT 1"})).is_err());
        assert!(v.validate(&json!({"bad\u{0}key": "v"})).is_err());
        assert!(v.validate(&json!([1, 2, "../../etc/passwd"])).is_err());
    }

    #[test]
    fn test_basic_level_skips_pattern_sets() {
        let v = input_validator(ValidationLevel::Basic);
        // Structural checks still run, pattern matching does not.
        assert!(v.validate(&json!("1 UNION SELECT 1")).is_ok());
        assert!(v.validate(&json!("null\u{0}")).is_err());
    }

    #[test]
    fn test_moderate_level_skips_xss() {
        let v = input_validator(ValidationLevel::Moderate);
        assert!(v.validate(&json!("<script>alert(1)</script>")).is_ok());
        assert!(v.validate(&json!("1 UNION SELECT 1")).is_err());
    }

    #[test]
    fn test_sql_verb_allow_list() {
        let v = sql_validator();
        assert_eq!(v.validate("SELECT 1").unwrap(), QueryVerb::Select);
        // TRUNCATE is a known verb but not in the default allow-list.
        assert!(matches!(
            v.validate("TRUNCATE TABLE t"),
            Err(GatewayError::SecurityViolation { .. })
        ));
        assert!(matches!(
            v.validate("GRANT ALL ON *.* TO x"),
            Err(GatewayError::SecurityViolation { .. })
        ));
    }

    #[test]
    fn test_sql_length_boundary() {
        let config = SecurityConfig {
            max_query_length: 30,
            ..SecurityConfig::default()
        };
        let v = SqlValidator::new(&config, detector(), Arc::new(AuditSink::disabled()));
        let exact = format!("SELECT {}", "x".repeat(23)); // 30 bytes
        assert_eq!(exact.len(), 30);
        assert!(v.validate(&exact).is_ok());
        let over = format!("SELECT {}", "x".repeat(24));
        assert!(v.validate(&over).is_err());
    }

    #[test]
    fn test_disallowed_file_operations() {
        let v = sql_validator();
        assert!(v.validate("SELECT LOAD_FILE('/etc/passwd')").is_err());
        assert!(v.validate("SELECT * FROM t INTO OUTFILE '/tmp/out'").is_err());
    }

    #[test]
    fn test_multi_statement_detection() {
        let v = sql_validator();
        assert!(v.validate("SELECT 1; DROP TABLE users").is_err());
        // A trailing terminator is fine.
        assert!(v.validate("SELECT 1;").is_ok());
        // Semicolons inside string literals are data, not separators.
        assert!(v
            .validate("SELECT * FROM notes WHERE body = 'a; b; c'")
            .is_ok());
    }

    #[test]
    fn test_injection_rejected_with_security_violation() {
        let v = sql_validator();
        let err = v
            .validate("SELECT * FROM t WHERE x='1' OR '1'='1'")
            .unwrap_err();
        assert_eq!(err.category(), "security-violation");
        let (_, rejected) = v.stats();
        assert_eq!(rejected, 1);
    }
}
