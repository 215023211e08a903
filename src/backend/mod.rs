// # Database Backend Seam
//
// The pool is generic over these traits so the core can run against
// MySQL in production and a scriptable mock in tests. The MySQL
// implementation is the only module that names the driver.

pub mod mysql;

#[cfg(test)]
pub mod mock;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Result of one statement execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryOutcome {
    /// Result rows as JSON objects; empty for mutating statements.
    pub rows: Vec<Value>,
    /// Rows affected by a mutating statement.
    pub affected_rows: u64,
    /// Captured from the statement handle, never from session state.
    pub last_insert_id: Option<u64>,
}

impl QueryOutcome {
    pub fn rows(rows: Vec<Value>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn affected(affected_rows: u64, last_insert_id: Option<u64>) -> Self {
        Self {
            rows: Vec::new(),
            affected_rows,
            last_insert_id,
        }
    }
}

/// A live database session owned by the pool and borrowed by callers.
#[async_trait]
pub trait Connection: Send {
    /// Server-side connection id, used for best-effort kill.
    fn thread_id(&self) -> u32;

    /// Execute one statement with positional parameters.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome>;

    /// Liveness probe.
    async fn ping(&mut self) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;

    /// Graceful disconnect.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens connections to one endpoint (primary or a replica).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Best-effort server-side kill of a running statement by its
    /// connection thread id. Uses a short-lived side channel.
    async fn kill(&self, thread_id: u32) -> Result<()>;

    /// Redacted endpoint label for logs.
    fn endpoint(&self) -> String;

    /// Replica endpoints serve reads only.
    fn read_only(&self) -> bool;
}
