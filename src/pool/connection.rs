// # Tracked Connections
//
// The pool owns connections; callers borrow a `ConnectionHandle` that
// returns its connection exactly once on release or drop. Each borrow
// records an acquire-site snapshot for leak reporting.

use super::endpoint::EndpointPool;
use crate::backend::{Connection, QueryOutcome};
use crate::error::{ErrorClass, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;

/// Bookkeeping for a borrowed connection.
#[derive(Debug, Clone)]
pub struct InUseInfo {
    pub id: String,
    pub acquired_at: Instant,
    /// Caller-supplied label (operation name, user id).
    pub tag: Option<String>,
    /// Stack snapshot at acquire time; contents depend on the
    /// process backtrace setting.
    pub acquire_site: String,
}

impl InUseInfo {
    pub fn new(id: String, tag: Option<String>) -> Self {
        Self {
            id,
            acquired_at: Instant::now(),
            tag,
            acquire_site: std::backtrace::Backtrace::capture().to_string(),
        }
    }
}

/// An idle pooled connection.
pub struct IdleConn {
    pub id: String,
    pub conn: Box<dyn Connection>,
    pub created_at: Instant,
    pub idled_at: Instant,
}

/// Caller-facing borrow of one connection. Dropping the handle returns
/// the connection; an explicit `release()` does the same. A second
/// release is a warning no-op.
pub struct ConnectionHandle {
    id: String,
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    pool: Arc<EndpointPool>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("broken", &self.broken)
            .finish()
    }
}

impl ConnectionHandle {
    pub(super) fn new(
        id: String,
        conn: Box<dyn Connection>,
        created_at: Instant,
        pool: Arc<EndpointPool>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            conn: Some(conn),
            created_at,
            pool,
            permit: Some(permit),
            broken: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> String {
        self.pool.endpoint()
    }

    pub fn read_only(&self) -> bool {
        self.pool.read_only()
    }

    /// Server-side connection id, if the connection is still held.
    pub fn thread_id(&self) -> Option<u32> {
        self.conn.as_ref().map(|c| c.thread_id())
    }

    /// Mark the session unusable; release will close it instead of
    /// returning it to the idle list.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Best-effort server-side kill of whatever this session runs.
    pub async fn kill_backend(&self) -> Result<()> {
        match self.conn.as_ref().map(|c| c.thread_id()) {
            Some(thread_id) => self.pool.kill(thread_id).await,
            None => Ok(()),
        }
    }

    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome> {
        let conn = self.conn_mut()?;
        let result = conn.query(sql, params).await;
        self.note_outcome(&result);
        result
    }

    pub async fn ping(&mut self) -> Result<()> {
        let conn = self.conn_mut()?;
        let result = conn.ping().await;
        self.note_outcome(&result);
        result
    }

    pub async fn begin(&mut self) -> Result<()> {
        let conn = self.conn_mut()?;
        let result = conn.begin().await;
        self.note_outcome(&result);
        result
    }

    pub async fn commit(&mut self) -> Result<()> {
        let conn = self.conn_mut()?;
        let result = conn.commit().await;
        self.note_outcome(&result);
        result
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let conn = self.conn_mut()?;
        let result = conn.rollback().await;
        self.note_outcome(&result);
        result
    }

    /// Return the connection to the pool now.
    pub fn release(mut self) {
        self.give_back();
    }

    fn conn_mut(&mut self) -> Result<&mut Box<dyn Connection>> {
        self.conn.as_mut().ok_or_else(|| {
            crate::error::GatewayError::Connection("connection already released".to_string())
        })
    }

    /// Connection-shaped failures poison the session.
    fn note_outcome<T>(&mut self, result: &Result<T>) {
        if let Err(err) = result {
            if matches!(
                err.class(),
                ErrorClass::Connection | ErrorClass::TransientNet | ErrorClass::Timeout
            ) {
                self.broken = true;
            }
        }
    }

    fn give_back(&mut self) {
        let Some(conn) = self.conn.take() else {
            tracing::warn!(
                component = "pool",
                connection = %self.id,
                "double release of pooled connection ignored"
            );
            self.pool.note_double_release();
            return;
        };
        self.pool
            .give_back(&self.id, conn, self.created_at, self.broken);
        // Free the capacity slot only after bookkeeping settled.
        self.permit.take();
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.give_back();
        }
    }
}
