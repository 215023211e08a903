// # Threat Pattern Detector
//
// A single normalized detection pipeline: lowercase, collapse
// whitespace, decode common percent-encodings, then match a registered
// set of compiled patterns grouped by threat type. All patterns are
// compiled once at startup into an immutable set.

use crate::error::Severity;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

/// Threat families the detector recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatKind {
    SqlInjection,
    DangerousOp,
    Xss,
    PathTraversal,
}

/// One registered pattern.
pub struct ThreatPattern {
    pub id: &'static str,
    pub kind: ThreatKind,
    pub severity: Severity,
    regex: Regex,
}

/// A pattern that fired on the normalized input.
#[derive(Debug, Clone, Serialize)]
pub struct PatternMatch {
    pub id: &'static str,
    pub kind: ThreatKind,
    pub severity: Severity,
}

/// Detection outcome: matches plus a 0..100 risk score where the
/// highest matched severity maps to 100.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionReport {
    pub matches: Vec<PatternMatch>,
    pub risk_score: u8,
}

impl DetectionReport {
    pub fn is_clean(&self) -> bool {
        self.matches.is_empty()
    }

    /// Highest severity among the matches, if any.
    pub fn max_severity(&self) -> Option<Severity> {
        self.matches.iter().map(|m| m.severity).max()
    }
}

fn pattern(id: &'static str, kind: ThreatKind, severity: Severity, re: &str) -> ThreatPattern {
    ThreatPattern {
        id,
        kind,
        severity,
        regex: Regex::new(re).expect("threat pattern must compile"),
    }
}

lazy_static! {
    static ref PATTERNS: Vec<ThreatPattern> = vec![
        // SQL injection
        pattern(
            "sqli-or-equality",
            ThreatKind::SqlInjection,
            Severity::Critical,
            r#"'\s*or\s+'[^']*'\s*=\s*'"#,
        ),
        pattern(
            "sqli-numeric-tautology",
            ThreatKind::SqlInjection,
            Severity::High,
            r"\bor\s+\d+\s*=\s*\d+",
        ),
        pattern(
            "sqli-union-select",
            ThreatKind::SqlInjection,
            Severity::Critical,
            r"\bunion\s+(?:all\s+)?select\b",
        ),
        pattern(
            "sqli-stacked-statement",
            ThreatKind::SqlInjection,
            Severity::Critical,
            r";\s*(?:select|insert|update|delete|drop|create|alter|truncate)\b",
        ),
        pattern(
            "sqli-comment",
            ThreatKind::SqlInjection,
            Severity::Medium,
            r"(?:--\s|/\*|\*/)",
        ),
        pattern(
            "sqli-time-based",
            ThreatKind::SqlInjection,
            Severity::High,
            r"\b(?:sleep|benchmark)\s*\(",
        ),
        pattern(
            "sqli-information-schema",
            ThreatKind::SqlInjection,
            Severity::Medium,
            r"\binformation_schema\b",
        ),
        pattern(
            "sqli-char-evasion",
            ThreatKind::SqlInjection,
            Severity::Medium,
            r"\bchar\s*\(\s*\d+",
        ),
        pattern(
            "sqli-hex-literal",
            ThreatKind::SqlInjection,
            Severity::Low,
            r"\b0x[0-9a-f]{16,}\b",
        ),
        // Dangerous server-side operations
        pattern(
            "danger-load-file",
            ThreatKind::DangerousOp,
            Severity::Critical,
            r"\bload_file\s*\(",
        ),
        pattern(
            "danger-outfile",
            ThreatKind::DangerousOp,
            Severity::Critical,
            r"\binto\s+(?:outfile|dumpfile)\b",
        ),
        pattern(
            "danger-drop-database",
            ThreatKind::DangerousOp,
            Severity::Critical,
            r"\bdrop\s+database\b",
        ),
        pattern(
            "danger-grant",
            ThreatKind::DangerousOp,
            Severity::High,
            r"\bgrant\b[^;]*\bto\b",
        ),
        pattern(
            "danger-shutdown",
            ThreatKind::DangerousOp,
            Severity::High,
            r"\bshutdown\b",
        ),
        pattern(
            "danger-system-proc",
            ThreatKind::DangerousOp,
            Severity::Critical,
            r"\bxp_cmdshell\b",
        ),
        // Cross-site scripting carried through stored values
        pattern("xss-script-tag", ThreatKind::Xss, Severity::High, r"<script\b"),
        pattern(
            "xss-javascript-url",
            ThreatKind::Xss,
            Severity::Medium,
            r"javascript\s*:",
        ),
        pattern(
            "xss-event-handler",
            ThreatKind::Xss,
            Severity::Medium,
            r#"\bon[a-z]+\s*=\s*["']"#,
        ),
        // Path traversal
        pattern(
            "path-dotdot",
            ThreatKind::PathTraversal,
            Severity::High,
            r"\.\./|\.\.\\",
        ),
        pattern(
            "path-etc-passwd",
            ThreatKind::PathTraversal,
            Severity::High,
            r"/etc/passwd",
        ),
    ];
}

fn risk_for(severity: Severity) -> u8 {
    match severity {
        Severity::Fatal | Severity::Critical => 100,
        Severity::High => 75,
        Severity::Medium => 50,
        Severity::Low => 25,
        Severity::Info => 10,
    }
}

/// Decode the percent-encodings attackers use to slip past keyword
/// filters. Invalid sequences are left untouched.
fn percent_decode(input: &str) -> String {
    fn hex_digit(byte: u8) -> Option<u8> {
        match byte {
            b'0'..=b'9' => Some(byte - b'0'),
            b'a'..=b'f' => Some(byte - b'a' + 10),
            b'A'..=b'F' => Some(byte - b'A' + 10),
            _ => None,
        }
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Immutable, compiled-at-startup pattern registry.
pub struct PatternDetector {
    patterns: &'static [ThreatPattern],
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternDetector {
    pub fn new() -> Self {
        Self { patterns: &PATTERNS }
    }

    /// Normalize then match every registered pattern.
    pub fn detect(&self, input: &str) -> DetectionReport {
        self.detect_kinds(input, None)
    }

    /// Match only the given threat families; `None` means all.
    pub fn detect_kinds(&self, input: &str, kinds: Option<&[ThreatKind]>) -> DetectionReport {
        let normalized = Self::normalize(input);
        let mut report = DetectionReport::default();
        for pattern in self.patterns {
            if let Some(kinds) = kinds {
                if !kinds.contains(&pattern.kind) {
                    continue;
                }
            }
            if pattern.regex.is_match(&normalized) {
                report.risk_score = report.risk_score.max(risk_for(pattern.severity));
                report.matches.push(PatternMatch {
                    id: pattern.id,
                    kind: pattern.kind,
                    severity: pattern.severity,
                });
            }
        }
        report
    }

    /// The shared normalization pipeline: lowercase, collapse
    /// whitespace, decode percent-encodings. Idempotent.
    pub fn normalize(input: &str) -> String {
        let decoded = percent_decode(input);
        decoded
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classic_tautology_detected() {
        let detector = PatternDetector::new();
        let report = detector.detect("SELECT * FROM t WHERE x='1' OR '1'='1'");
        assert!(!report.is_clean());
        assert_eq!(report.risk_score, 100);
        assert!(report.matches.iter().any(|m| m.id == "sqli-or-equality"));
    }

    #[test]
    fn test_union_and_stacked_detected() {
        let detector = PatternDetector::new();
        assert!(!detector.detect("1 UNION SELECT password FROM users").is_clean());
        assert!(!detector.detect("1; DROP TABLE users").is_clean());
    }

    #[test]
    fn test_percent_encoding_decoded_before_match() {
        let detector = PatternDetector::new();
        // %27 = ', %3D = =  -> '1' OR '1'='1'
        let report = detector.detect("x=%271%27%20OR%20%271%27%3D%271%27");
        assert!(!report.is_clean());
    }

    #[test]
    fn test_dangerous_operations_detected() {
        let detector = PatternDetector::new();
        assert!(!detector.detect("SELECT LOAD_FILE('/etc/passwd')").is_clean());
        assert!(!detector.detect("SELECT * INTO OUTFILE '/tmp/x'").is_clean());
        assert!(!detector.detect("DROP DATABASE production").is_clean());
    }

    #[test]
    fn test_xss_and_traversal_detected() {
        let detector = PatternDetector::new();
        assert!(detector
            .detect("<script>alert(1)</script>")
            .matches
            .iter()
            .any(|m| m.kind == ThreatKind::Xss));
        assert!(detector
            .detect("../../etc/passwd")
            .matches
            .iter()
            .any(|m| m.kind == ThreatKind::PathTraversal));
    }

    #[test]
    fn test_benign_input_is_clean() {
        let detector = PatternDetector::new();
        assert!(detector.detect("SELECT id, name FROM users WHERE id = ?").is_clean());
        assert!(detector.detect("ordinary text value").is_clean());
    }

    #[test]
    fn test_kind_filter_limits_patterns() {
        let detector = PatternDetector::new();
        let report = detector.detect_kinds(
            "<script>alert(1)</script>",
            Some(&[ThreatKind::SqlInjection]),
        );
        assert!(report.is_clean());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = PatternDetector::normalize("SELECT%20*  FROM t");
        assert_eq!(PatternDetector::normalize(&once), once);
    }

    #[test]
    fn test_risk_score_scales_with_severity() {
        let detector = PatternDetector::new();
        let medium = detector.detect("select * from information_schema.tables");
        assert_eq!(medium.risk_score, 50);
        let critical = detector.detect("1 UNION SELECT 1");
        assert_eq!(critical.risk_score, 100);
    }
}
