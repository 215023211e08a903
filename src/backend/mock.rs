// # Scriptable Mock Backend
//
// Test-only backend used to drive the pool and executor end-to-end
// without a MySQL server. Behavior is scripted through shared state:
// canned rows per statement, queued errors, ping/connect failure
// switches, and counters for every interaction.

use super::{Connection, Connector, QueryOutcome};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared, inspectable state for one mock endpoint.
#[derive(Default)]
pub struct MockState {
    pub connects: AtomicU64,
    pub connect_failures: AtomicU64,
    pub queries: AtomicU64,
    pub pings: AtomicU64,
    pub begins: AtomicU64,
    pub commits: AtomicU64,
    pub rollbacks: AtomicU64,
    pub closes: AtomicU64,
    /// When set, `connect` fails with a connection error.
    pub fail_connect: AtomicBool,
    /// When set, `ping` fails with a connection error.
    pub fail_ping: AtomicBool,
    /// Errors handed out for upcoming queries, in order.
    pub scripted_errors: Mutex<VecDeque<GatewayError>>,
    /// Errors keyed by exact SQL text; consumed once per entry.
    pub fail_sql: Mutex<HashMap<String, GatewayError>>,
    /// Canned result rows keyed by exact SQL text.
    pub canned_rows: Mutex<HashMap<String, Vec<Value>>>,
    /// Every executed statement, in order.
    pub executed: Mutex<Vec<String>>,
    /// Thread ids passed to `kill`.
    pub kills: Mutex<Vec<u32>>,
    next_thread_id: AtomicU32,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_error(&self, error: GatewayError) {
        self.scripted_errors.lock().push_back(error);
    }

    pub fn set_rows(&self, sql: &str, rows: Vec<Value>) {
        self.canned_rows.lock().insert(sql.to_string(), rows);
    }

    pub fn executed_statements(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

/// Mock endpoint factory.
pub struct MockConnector {
    pub name: String,
    pub read_only: bool,
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new(name: impl Into<String>, read_only: bool, state: Arc<MockState>) -> Self {
        Self {
            name: name.into(),
            read_only,
            state,
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            self.state.connect_failures.fetch_add(1, Ordering::SeqCst);
            return Err(GatewayError::Connection(format!(
                "mock endpoint {} refused connection",
                self.name
            )));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_thread_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockConnection {
            thread_id: id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn kill(&self, thread_id: u32) -> Result<()> {
        self.state.kills.lock().push(thread_id);
        Ok(())
    }

    fn endpoint(&self) -> String {
        self.name.clone()
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// One mock session.
pub struct MockConnection {
    thread_id: u32,
    state: Arc<MockState>,
}

#[async_trait]
impl Connection for MockConnection {
    fn thread_id(&self) -> u32 {
        self.thread_id
    }

    async fn query(&mut self, sql: &str, _params: &[Value]) -> Result<QueryOutcome> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        self.state.executed.lock().push(sql.to_string());

        if let Some(error) = self.state.scripted_errors.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.state.fail_sql.lock().remove(sql) {
            return Err(error);
        }
        if let Some(rows) = self.state.canned_rows.lock().get(sql) {
            return Ok(QueryOutcome::rows(rows.clone()));
        }

        let is_read = crate::security::QueryVerb::parse(sql)
            .map(|v| v.is_read())
            .unwrap_or(false);
        if is_read {
            Ok(QueryOutcome::rows(Vec::new()))
        } else {
            Ok(QueryOutcome::affected(1, Some(1)))
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_ping.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("mock ping failed".into()));
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        self.state.executed.lock().push("START TRANSACTION".into());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        self.state.executed.lock().push("COMMIT".into());
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.state.executed.lock().push("ROLLBACK".into());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
