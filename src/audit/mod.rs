// # Audit Sinks
//
// Append-only JSONL sinks for security events, recovery events and
// alerts. One JSON object per line, `{ts, severity, type, details}`.
// Sink failures are logged and swallowed; a failed audit write must
// never fail a user request.

use crate::common::now_rfc3339;
use crate::error::Severity;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A single audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: String,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub kind: String,
    pub details: serde_json::Value,
}

/// Counters surfaced in diagnostics snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub events_recorded: u64,
    pub alerts_recorded: u64,
    pub write_failures: u64,
}

/// Event and alert log writer. Alerts are events with severity >= HIGH,
/// mirrored into a separate file.
pub struct AuditSink {
    events_path: Option<PathBuf>,
    alerts_path: Option<PathBuf>,
    write_lock: Mutex<()>,
    events_recorded: AtomicU64,
    alerts_recorded: AtomicU64,
    write_failures: AtomicU64,
}

impl AuditSink {
    /// Sink writing `events.log` and `alerts.log` under `state_dir`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let dir = state_dir.as_ref();
        Self {
            events_path: Some(dir.join("events.log")),
            alerts_path: Some(dir.join("alerts.log")),
            write_lock: Mutex::new(()),
            events_recorded: AtomicU64::new(0),
            alerts_recorded: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Sink that counts but never touches the filesystem.
    pub fn disabled() -> Self {
        Self {
            events_path: None,
            alerts_path: None,
            write_lock: Mutex::new(()),
            events_recorded: AtomicU64::new(0),
            alerts_recorded: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Record an event; severity >= HIGH is mirrored to the alert log.
    pub fn record(&self, kind: &str, severity: Severity, details: serde_json::Value) {
        let event = AuditEvent {
            ts: now_rfc3339(),
            severity,
            kind: kind.to_string(),
            details,
        };
        self.events_recorded.fetch_add(1, Ordering::Relaxed);
        if severity >= Severity::High {
            self.alerts_recorded.fetch_add(1, Ordering::Relaxed);
        }

        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(component = "audit", error = %err, "failed to serialize audit event");
                return;
            }
        };

        let _guard = self.write_lock.lock();
        if let Some(path) = &self.events_path {
            self.append_line(path, &line);
        }
        if severity >= Severity::High {
            if let Some(path) = &self.alerts_path {
                self.append_line(path, &line);
            }
        }
    }

    /// Record a security event under the `security` type family.
    pub fn security_event(&self, detail_kind: &str, severity: Severity, details: serde_json::Value) {
        self.record(
            "security",
            severity,
            serde_json::json!({ "event": detail_kind, "info": details }),
        );
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            events_recorded: self.events_recorded.load(Ordering::Relaxed),
            alerts_recorded: self.alerts_recorded.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    fn append_line(&self, path: &Path, line: &str) {
        let attempt = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = attempt {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                component = "audit",
                path = %path.display(),
                error = %err,
                "audit log append failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_events_and_alerts_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path());

        sink.record("security", Severity::Low, json!({"q": 1}));
        sink.record("recovery", Severity::Critical, json!({"stage": 2}));

        let events = std::fs::read_to_string(dir.path().join("events.log")).unwrap();
        assert_eq!(events.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(events.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "security");
        assert_eq!(first["severity"], "low");

        // Only the critical event lands in the alert log.
        let alerts = std::fs::read_to_string(dir.path().join("alerts.log")).unwrap();
        assert_eq!(alerts.lines().count(), 1);
        assert!(alerts.contains("recovery"));

        let stats = sink.stats();
        assert_eq!(stats.events_recorded, 2);
        assert_eq!(stats.alerts_recorded, 1);
        assert_eq!(stats.write_failures, 0);
    }

    #[test]
    fn test_disabled_sink_counts_without_files() {
        let sink = AuditSink::disabled();
        sink.record("security", Severity::High, json!({}));
        let stats = sink.stats();
        assert_eq!(stats.events_recorded, 1);
        assert_eq!(stats.alerts_recorded, 1);
    }
}
