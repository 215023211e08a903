// # Query Executor
//
// The facade every tool endpoint calls. One ordered pipeline for all
// operations: rate limit, validate, authorize, consult the query
// cache, execute on a pooled connection under smart retry, then
// post-process, cache or invalidate, and record metrics. The executor
// itself is stateless; shared state lives in the components supplied
// at construction.

pub mod metrics;

pub use metrics::{ExecutorMetrics, MetricsSnapshot};

use crate::backend::QueryOutcome;
use crate::cache::query_cache::{extract_tables, is_cacheable, CachedQueryResult};
use crate::cache::CacheManager;
use crate::common::Redactor;
use crate::config::SecurityConfig;
use crate::error::{GatewayError, Result};
use crate::memory::PressureController;
use crate::pool::{ConnectionHandle, SessionManager};
use crate::ratelimit::{AdaptiveRateLimiter, GLOBAL_IDENTIFIER};
use crate::retry::{RetryContext, SmartRetry};
use crate::security::rbac::RbacAuthorizer;
use crate::security::validator::{InputValidator, SqlValidator};
use crate::security::QueryVerb;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Smallest batch the insert path will shrink to under pressure.
const MIN_INSERT_BATCH: usize = 50;

/// Upper bound on concurrently running insert batches.
const MAX_PARALLEL_BATCHES: usize = 4;

/// Shape a cache hit the way a freshly executed read would look.
fn outcome_from_cache(hit: &CachedQueryResult, elapsed_ms: u64) -> ExecOutcome {
    let rows = match &hit.rows {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    ExecOutcome {
        row_count: hit.row_count,
        rows: Some(rows),
        affected_rows: 0,
        last_insert_id: None,
        truncated: false,
        from_cache: true,
        attempts: 0,
        elapsed_ms,
    }
}

/// Identifier shape for table and column names.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
}

/// Admission control seam.
pub trait RateLimiter: Send + Sync {
    fn check(&self, identifier: &str) -> Result<()>;
    fn refund(&self, identifier: &str);
}

impl RateLimiter for AdaptiveRateLimiter {
    fn check(&self, identifier: &str) -> Result<()> {
        AdaptiveRateLimiter::check(self, identifier)
    }

    fn refund(&self, identifier: &str) {
        AdaptiveRateLimiter::refund(self, identifier)
    }
}

/// Authorization seam.
pub trait Authorizer: Send + Sync {
    fn check(&self, user_id: &str, permission: &str) -> bool;
}

impl Authorizer for RbacAuthorizer {
    fn check(&self, user_id: &str, permission: &str) -> bool {
        RbacAuthorizer::check(self, user_id, permission)
    }
}

/// Connection acquisition seam; reads may route to replicas.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn get_read(&self, tag: Option<String>) -> Result<ConnectionHandle>;
    async fn get_write(&self, tag: Option<String>) -> Result<ConnectionHandle>;
}

#[async_trait]
impl ConnectionProvider for SessionManager {
    async fn get_read(&self, tag: Option<String>) -> Result<ConnectionHandle> {
        SessionManager::get_read(self, tag).await
    }

    async fn get_write(&self, tag: Option<String>) -> Result<ConnectionHandle> {
        SessionManager::get_write(self, tag).await
    }
}

/// Memory-pressure readout used to size insert batches.
pub trait LoadProbe: Send + Sync {
    fn pressure(&self) -> f64;
}

impl LoadProbe for PressureController {
    fn pressure(&self) -> f64 {
        self.current_pressure()
    }
}

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_result_rows: usize,
    pub query_timeout: Duration,
    pub slow_query_threshold: Duration,
    pub batch_insert_size: usize,
}

impl ExecutorConfig {
    pub fn from_security(config: &SecurityConfig) -> Self {
        Self {
            max_result_rows: config.max_result_rows,
            query_timeout: config.query_timeout,
            slow_query_threshold: Duration::from_secs(1),
            batch_insert_size: 500,
        }
    }
}

/// What one operation produced.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    /// Present for read queries; redacted and truncated.
    pub rows: Option<Vec<Value>>,
    pub row_count: usize,
    pub affected_rows: u64,
    pub last_insert_id: Option<u64>,
    pub truncated: bool,
    pub from_cache: bool,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// Result of a chunked batch insert.
#[derive(Debug, Clone, Serialize)]
pub struct BatchInsertOutcome {
    pub affected: u64,
    pub batches: usize,
}

/// How one statement inside a batch was satisfied.
enum BatchStep {
    Cached(Arc<CachedQueryResult>),
    Executed(QueryOutcome),
}

/// The pipeline facade.
pub struct QueryExecutor {
    config: ExecutorConfig,
    sql_validator: Arc<SqlValidator>,
    input_validator: Arc<InputValidator>,
    /// Cell-level checks for bulk inserts run at the basic level.
    basic_validator: Arc<InputValidator>,
    authorizer: Arc<dyn Authorizer>,
    limiter: Arc<dyn RateLimiter>,
    cache: Arc<CacheManager>,
    pool: Arc<dyn ConnectionProvider>,
    retry: SmartRetry,
    load: Arc<dyn LoadProbe>,
    metrics: Arc<ExecutorMetrics>,
    redactor: Redactor,
}

impl QueryExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        sql_validator: Arc<SqlValidator>,
        input_validator: Arc<InputValidator>,
        basic_validator: Arc<InputValidator>,
        authorizer: Arc<dyn Authorizer>,
        limiter: Arc<dyn RateLimiter>,
        cache: Arc<CacheManager>,
        pool: Arc<dyn ConnectionProvider>,
        retry: SmartRetry,
        load: Arc<dyn LoadProbe>,
        metrics: Arc<ExecutorMetrics>,
    ) -> Self {
        Self {
            config,
            sql_validator,
            input_validator,
            basic_validator,
            authorizer,
            limiter,
            cache,
            pool,
            retry,
            load,
            metrics,
            redactor: Redactor::new(),
        }
    }

    pub fn metrics(&self) -> Arc<ExecutorMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Execute one statement.
    pub async fn exec(
        &self,
        sql: &str,
        params: &[Value],
        user_id: Option<&str>,
    ) -> Result<ExecOutcome> {
        let started = Instant::now();
        let result = self.exec_inner(sql, params, user_id, started).await;
        match &result {
            Ok(outcome) => self.metrics.record_query(
                started.elapsed(),
                self.config.slow_query_threshold,
                outcome.attempts,
            ),
            Err(err) => self.metrics.record_failure(err.category()),
        }
        result
    }

    async fn exec_inner(
        &self,
        sql: &str,
        params: &[Value],
        user_id: Option<&str>,
        started: Instant,
    ) -> Result<ExecOutcome> {
        let limiter_id = user_id.unwrap_or(GLOBAL_IDENTIFIER);
        self.limiter.check(limiter_id)?;

        // A request turned away before it reaches the database gives
        // its admission token back.
        let (verb, tables) = match self.pre_checks(sql, params, user_id) {
            Ok(checked) => checked,
            Err(err) => {
                self.limiter.refund(limiter_id);
                return Err(err);
            }
        };

        if verb.is_read() {
            if let Some(hit) = self.lookup_cached(sql, params) {
                return Ok(outcome_from_cache(&hit, started.elapsed().as_millis() as u64));
            }
        }

        let user_owned: Option<String> = user_id.map(String::from);
        let context = RetryContext {
            session: None,
            user: user_owned.clone(),
            operation: "exec".to_string(),
        };
        let mutating = verb.is_mutating();
        let outcome = self
            .retry
            .run(&context, |_attempt| {
                let tag = Some(match &user_owned {
                    Some(user) => format!("exec:{user}"),
                    None => "exec".to_string(),
                });
                async move {
                    let mut handle = if mutating {
                        self.pool.get_write(tag).await?
                    } else {
                        self.pool.get_read(tag).await?
                    };
                    self.run_statement(&mut handle, sql, params).await
                }
            })
            .await;

        let query_result = outcome.result?;
        let attempts = outcome.attempts;

        let exec_outcome = if verb.is_read() {
            self.post_process_read(
                sql,
                params,
                query_result,
                attempts,
                started.elapsed().as_millis() as u64,
            )
        } else {
            // Invalidation publishes before the result returns so no
            // subsequent read can observe a stale entry.
            self.cache
                .invalidate_by_operation(verb, tables.first().map(String::as_str));
            ExecOutcome {
                rows: None,
                row_count: 0,
                affected_rows: query_result.affected_rows,
                last_insert_id: query_result.last_insert_id,
                truncated: false,
                from_cache: false,
                attempts,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        };

        Ok(exec_outcome)
    }

    /// Execute several statements in one transaction, in input order.
    /// Any failure rolls back and surfaces the first error.
    pub async fn batch_exec(
        &self,
        queries: &[(String, Vec<Value>)],
        user_id: Option<&str>,
    ) -> Result<Vec<ExecOutcome>> {
        let started = Instant::now();
        let result = self.batch_exec_inner(queries, user_id, started).await;
        match &result {
            Ok(outcomes) => {
                let attempts = outcomes.first().map(|o| o.attempts).unwrap_or(1);
                self.metrics
                    .record_query(started.elapsed(), self.config.slow_query_threshold, attempts);
            }
            Err(err) => self.metrics.record_failure(err.category()),
        }
        result
    }

    async fn batch_exec_inner(
        &self,
        queries: &[(String, Vec<Value>)],
        user_id: Option<&str>,
        started: Instant,
    ) -> Result<Vec<ExecOutcome>> {
        if queries.is_empty() {
            return Err(GatewayError::Validation("empty batch".to_string()));
        }
        let limiter_id = user_id.unwrap_or(GLOBAL_IDENTIFIER);
        self.limiter.check(limiter_id)?;

        let mut plans = Vec::with_capacity(queries.len());
        for (sql, params) in queries {
            match self.pre_checks(sql, params, user_id) {
                Ok(plan) => plans.push(plan),
                Err(err) => {
                    self.limiter.refund(limiter_id);
                    return Err(err);
                }
            }
        }

        // Step 4, per read statement: consult the query cache.
        let mut cached: Vec<Option<Arc<CachedQueryResult>>> = Vec::with_capacity(queries.len());
        for ((sql, params), (verb, _)) in queries.iter().zip(plans.iter()) {
            if verb.is_read() {
                cached.push(self.lookup_cached(sql, params));
            } else {
                cached.push(None);
            }
        }

        // Every statement a cached read: nothing to run transactionally.
        if plans
            .iter()
            .zip(cached.iter())
            .all(|((verb, _), hit)| verb.is_read() && hit.is_some())
        {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(cached
                .into_iter()
                .flatten()
                .map(|hit| outcome_from_cache(&hit, elapsed_ms))
                .collect());
        }

        let user_owned: Option<String> = user_id.map(String::from);
        let context = RetryContext {
            session: None,
            user: user_owned.clone(),
            operation: "batch_exec".to_string(),
        };
        let outcome = self
            .retry
            .run(&context, |_attempt| {
                let tag = Some("batch_exec".to_string());
                let cached = &cached;
                async move {
                    let mut handle = self.pool.get_write(tag).await?;
                    handle.begin().await?;
                    let mut steps = Vec::with_capacity(queries.len());
                    for (index, (sql, params)) in queries.iter().enumerate() {
                        if let Some(hit) = &cached[index] {
                            steps.push(BatchStep::Cached(Arc::clone(hit)));
                            continue;
                        }
                        match self.run_statement(&mut handle, sql, params).await {
                            Ok(result) => steps.push(BatchStep::Executed(result)),
                            Err(err) => {
                                // Cleanup failure must not mask the cause.
                                if let Err(rollback_err) = handle.rollback().await {
                                    tracing::warn!(
                                        component = "executor",
                                        error = %rollback_err,
                                        "rollback failed after batch error"
                                    );
                                }
                                return Err(err);
                            }
                        }
                    }
                    handle.commit().await?;
                    Ok(steps)
                }
            })
            .await;

        let steps = outcome.result?;
        let attempts = outcome.attempts;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        // Step 6/7 per statement: post-process executed reads and
        // store the cacheable ones.
        let mut outcomes = Vec::with_capacity(steps.len());
        for ((step, (verb, _)), (sql, params)) in
            steps.into_iter().zip(plans.iter()).zip(queries.iter())
        {
            match step {
                BatchStep::Cached(hit) => outcomes.push(outcome_from_cache(&hit, elapsed_ms)),
                BatchStep::Executed(result) if verb.is_read() => {
                    outcomes.push(self.post_process_read(sql, params, result, attempts, elapsed_ms));
                }
                BatchStep::Executed(result) => outcomes.push(ExecOutcome {
                    rows: None,
                    row_count: 0,
                    affected_rows: result.affected_rows,
                    last_insert_id: result.last_insert_id,
                    truncated: false,
                    from_cache: false,
                    attempts,
                    elapsed_ms,
                }),
            }
        }

        // Step 8 after the stores, so a table both read and mutated in
        // this batch ends up invalidated, not stale. A mutating
        // statement with no parsed table clears conservatively.
        let mut mutated: HashSet<String> = HashSet::new();
        for (verb, tables) in &plans {
            if !verb.is_mutating() {
                continue;
            }
            if tables.is_empty() {
                self.cache.invalidate_by_operation(*verb, None);
            } else if verb.is_ddl() {
                for table in tables {
                    self.cache.invalidate_by_operation(*verb, Some(table));
                }
            } else {
                mutated.extend(tables.iter().cloned());
            }
        }
        for table in mutated {
            self.cache.query().invalidate_table(&table);
        }

        Ok(outcomes)
    }

    /// Chunked multi-row insert. Batch size shrinks under memory
    /// pressure; large inputs run a bounded number of batches in
    /// parallel, each in its own transaction.
    pub async fn batch_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
        user_id: Option<&str>,
    ) -> Result<BatchInsertOutcome> {
        let started = Instant::now();
        let result = self.batch_insert_inner(table, columns, rows, user_id).await;
        match &result {
            Ok(_) => self
                .metrics
                .record_query(started.elapsed(), self.config.slow_query_threshold, 1),
            Err(err) => self.metrics.record_failure(err.category()),
        }
        result
    }

    async fn batch_insert_inner(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
        user_id: Option<&str>,
    ) -> Result<BatchInsertOutcome> {
        let limiter_id = user_id.unwrap_or(GLOBAL_IDENTIFIER);
        self.limiter.check(limiter_id)?;

        if let Err(err) = self.validate_insert_shape(table, columns, rows, user_id) {
            self.limiter.refund(limiter_id);
            return Err(err);
        }

        let batch_size = self.optimal_batch_size();
        let chunks: Vec<&[Vec<Value>]> = rows.chunks(batch_size).collect();
        let batches = chunks.len();
        let concurrency = if batches >= MAX_PARALLEL_BATCHES {
            MAX_PARALLEL_BATCHES
                .min(batches / 2)
                .min(num_cpus::get())
                .max(1)
        } else {
            1
        };

        let user_owned: Option<String> = user_id.map(String::from);
        let results: Vec<Result<u64>> = stream::iter(
            chunks
                .iter()
                .map(|chunk| self.insert_chunk(table, columns, chunk, user_owned.clone())),
        )
        .buffer_unordered(concurrency)
        .collect()
        .await;

        let mut affected = 0u64;
        for result in results {
            affected += result?;
        }

        self.cache.invalidate_by_operation(QueryVerb::Insert, Some(table));
        Ok(BatchInsertOutcome { affected, batches })
    }

    fn validate_insert_shape(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
        user_id: Option<&str>,
    ) -> Result<()> {
        if !is_valid_identifier(table) {
            return Err(GatewayError::Validation(format!(
                "invalid table name: {table}"
            )));
        }
        if columns.is_empty() || rows.is_empty() {
            return Err(GatewayError::Validation(
                "batch insert requires columns and rows".to_string(),
            ));
        }
        for column in columns {
            if !is_valid_identifier(column) {
                return Err(GatewayError::Validation(format!(
                    "invalid column name: {column}"
                )));
            }
        }
        for (index, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(GatewayError::Validation(format!(
                    "row {index} has {} values for {} columns",
                    row.len(),
                    columns.len()
                )));
            }
            for cell in row {
                self.basic_validator.validate(cell)?;
            }
        }
        if let Some(user) = user_id {
            let permission = format!("INSERT:{}", table.to_lowercase());
            if !self.authorizer.check(user, &permission) {
                return Err(GatewayError::AccessDenied(format!(
                    "user {user} lacks {permission}"
                )));
            }
        }
        Ok(())
    }

    /// Higher pressure, smaller batches.
    fn optimal_batch_size(&self) -> usize {
        let pressure = self.load.pressure().clamp(0.0, 1.0);
        let scaled = (self.config.batch_insert_size as f64 * (1.0 - pressure)) as usize;
        scaled.clamp(MIN_INSERT_BATCH, self.config.batch_insert_size)
    }

    async fn insert_chunk(
        &self,
        table: &str,
        columns: &[String],
        chunk: &[Vec<Value>],
        user: Option<String>,
    ) -> Result<u64> {
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let values_clause = vec![placeholders; chunk.len()].join(", ");
        let column_list = columns
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("INSERT INTO `{table}` ({column_list}) VALUES {values_clause}");
        let params: Vec<Value> = chunk.iter().flatten().cloned().collect();

        let context = RetryContext {
            session: None,
            user,
            operation: "batch_insert".to_string(),
        };
        let outcome = self
            .retry
            .run(&context, |_attempt| {
                let sql = sql.clone();
                let params = params.clone();
                async move {
                    let mut handle = self.pool.get_write(Some("batch_insert".to_string())).await?;
                    handle.begin().await?;
                    match self.run_statement(&mut handle, &sql, &params).await {
                        Ok(result) => {
                            handle.commit().await?;
                            Ok(result.affected_rows)
                        }
                        Err(err) => {
                            if let Err(rollback_err) = handle.rollback().await {
                                tracing::warn!(
                                    component = "executor",
                                    error = %rollback_err,
                                    "rollback failed after insert error"
                                );
                            }
                            Err(err)
                        }
                    }
                }
            })
            .await;
        outcome.result
    }

    /// Step 4 of the pipeline: consult the query cache for a read
    /// statement, recording hit/miss counters.
    fn lookup_cached(&self, sql: &str, params: &[Value]) -> Option<Arc<CachedQueryResult>> {
        match self.cache.query().lookup(sql, params) {
            Some(hit) => {
                self.metrics.record_cache_hit();
                Some(hit)
            }
            None => {
                if is_cacheable(sql) {
                    self.metrics.record_cache_miss();
                }
                None
            }
        }
    }

    /// Steps 6 and 7 for a read result: truncate, redact, and store
    /// the processed rows when the entry is cacheable and complete.
    fn post_process_read(
        &self,
        sql: &str,
        params: &[Value],
        result: QueryOutcome,
        attempts: u32,
        elapsed_ms: u64,
    ) -> ExecOutcome {
        let mut rows = result.rows;
        let truncated = rows.len() > self.config.max_result_rows;
        rows.truncate(self.config.max_result_rows);
        let rows: Vec<Value> = rows.iter().map(|row| self.redactor.redact_json(row)).collect();
        let row_count = rows.len();

        if !truncated {
            self.cache
                .query()
                .store(sql, params, Value::Array(rows.clone()), row_count);
        }

        ExecOutcome {
            rows: Some(rows),
            row_count,
            affected_rows: 0,
            last_insert_id: None,
            truncated,
            from_cache: false,
            attempts,
            elapsed_ms,
        }
    }

    /// Shared validation prefix: SQL rules, parameter rules, RBAC.
    fn pre_checks(
        &self,
        sql: &str,
        params: &[Value],
        user_id: Option<&str>,
    ) -> Result<(QueryVerb, Vec<String>)> {
        let verb = self.sql_validator.validate(sql)?;
        self.input_validator.validate_params(params)?;
        let tables = extract_tables(sql);

        if let Some(user) = user_id {
            let permission = match tables.first() {
                Some(table) => format!("{}:{}", verb.as_str(), table),
                None => verb.as_str().to_string(),
            };
            if !self.authorizer.check(user, &permission) {
                tracing::warn!(
                    component = "executor",
                    user,
                    permission = %permission,
                    "authorization denied"
                );
                return Err(GatewayError::AccessDenied(format!(
                    "user {user} lacks {permission}"
                )));
            }
        }
        Ok((verb, tables))
    }

    /// Run one statement on a borrowed connection with the server-side
    /// timeout; a local deadline backstops it and kills the statement.
    async fn run_statement(
        &self,
        handle: &mut ConnectionHandle,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryOutcome> {
        match tokio::time::timeout(self.config.query_timeout, handle.query(sql, params)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                if let Err(err) = handle.kill_backend().await {
                    tracing::debug!(component = "executor", error = %err, "statement kill failed");
                }
                handle.mark_broken();
                Err(GatewayError::Timeout(format!(
                    "query exceeded {:?}",
                    self.config.query_timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::backend::mock::{MockConnector, MockState};
    use crate::backend::Connector;
    use crate::config::{CacheConfig, SecurityConfig, ValidationLevel};
    use crate::pool::{BreakerConfig, SessionManagerConfig};
    use crate::retry::RetryPolicy;
    use crate::security::PatternDetector;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Harness {
        executor: QueryExecutor,
        primary: Arc<MockState>,
        replicas: Vec<Arc<MockState>>,
        limiter: Arc<AdaptiveRateLimiter>,
        rbac: Arc<RbacAuthorizer>,
        cache: Arc<CacheManager>,
        audit: Arc<AuditSink>,
    }

    struct FixedLoad(f64);

    impl LoadProbe for FixedLoad {
        fn pressure(&self) -> f64 {
            self.0
        }
    }

    fn harness_with(replica_count: usize, security: SecurityConfig, load: f64) -> Harness {
        let audit = Arc::new(AuditSink::disabled());
        let detector = Arc::new(PatternDetector::new());

        let primary_state = MockState::new();
        let replica_states: Vec<Arc<MockState>> =
            (0..replica_count).map(|_| MockState::new()).collect();
        let primary_connector = Arc::new(MockConnector::new(
            "primary",
            false,
            Arc::clone(&primary_state),
        ));
        let replica_connectors: Vec<Arc<dyn Connector>> = replica_states
            .iter()
            .enumerate()
            .map(|(i, state)| {
                Arc::new(MockConnector::new(
                    format!("replica-{i}"),
                    true,
                    Arc::clone(state),
                )) as Arc<dyn Connector>
            })
            .collect();

        let manager_config = SessionManagerConfig {
            db_name: "appdb".to_string(),
            min: 1,
            max: 4,
            connect_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            leak_scan_interval: Duration::from_secs(30),
            leak_threshold: Duration::from_secs(60),
            stats_interval: Duration::from_secs(300),
            drain_timeout: Duration::from_millis(200),
            breaker: BreakerConfig::default(),
            stats_path: None,
        };
        let pool = SessionManager::new(
            manager_config,
            primary_connector,
            replica_connectors,
            Arc::clone(&audit),
        );

        let cache = Arc::new(CacheManager::new(&CacheConfig::default()));
        let limiter = Arc::new(AdaptiveRateLimiter::new(&security, Arc::clone(&audit)));
        let rbac = Arc::new(RbacAuthorizer::new());
        let sql_validator = Arc::new(SqlValidator::new(
            &security,
            Arc::clone(&detector),
            Arc::clone(&audit),
        ));
        let input_validator = Arc::new(InputValidator::new(
            &security,
            Arc::clone(&detector),
            Arc::clone(&audit),
        ));
        let basic_security = SecurityConfig {
            validation_level: ValidationLevel::Basic,
            ..security.clone()
        };
        let basic_validator = Arc::new(InputValidator::new(
            &basic_security,
            Arc::clone(&detector),
            Arc::clone(&audit),
        ));

        let retry = SmartRetry::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: false,
        });

        let executor = QueryExecutor::new(
            ExecutorConfig::from_security(&security),
            sql_validator,
            input_validator,
            basic_validator,
            Arc::clone(&rbac) as Arc<dyn Authorizer>,
            Arc::clone(&limiter) as Arc<dyn RateLimiter>,
            Arc::clone(&cache),
            pool as Arc<dyn ConnectionProvider>,
            retry,
            Arc::new(FixedLoad(load)),
            Arc::new(ExecutorMetrics::new()),
        );

        Harness {
            executor,
            primary: primary_state,
            replicas: replica_states,
            limiter,
            rbac,
            cache,
            audit,
        }
    }

    fn harness() -> Harness {
        harness_with(0, SecurityConfig::default(), 0.0)
    }

    #[tokio::test]
    async fn test_select_roundtrip_cache_and_invalidation() {
        let h = harness();
        let sql = "SELECT id FROM users WHERE id = ?";
        let params = vec![json!(42)];
        h.primary.set_rows(sql, vec![json!({"id": 42})]);

        let first = h.executor.exec(sql, &params, None).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.rows.as_ref().unwrap().len(), 1);
        assert_eq!(h.primary.queries.load(Ordering::SeqCst), 1);

        // Second call is served from cache; the pool is not touched.
        let second = h.executor.exec(sql, &params, None).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.rows.as_ref().unwrap(), first.rows.as_ref().unwrap());
        assert_eq!(h.primary.queries.load(Ordering::SeqCst), 1);

        // A write to the same table invalidates the cached entry.
        let update = h
            .executor
            .exec("UPDATE users SET name = ? WHERE id = ?", &[json!("x"), json!(42)], None)
            .await
            .unwrap();
        assert_eq!(update.affected_rows, 1);

        let third = h.executor.exec(sql, &params, None).await.unwrap();
        assert!(!third.from_cache);
        assert_eq!(h.primary.queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_injection_blocked_before_any_connection() {
        let h = harness();
        let err = h
            .executor
            .exec("SELECT * FROM t WHERE x='1' OR '1'='1'", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "security-violation");

        // No connection was acquired, the token was refunded, and a
        // security event was recorded.
        assert_eq!(h.primary.connects.load(Ordering::SeqCst), 0);
        assert_eq!(h.primary.queries.load(Ordering::SeqCst), 0);
        assert_eq!(h.limiter.stats().refunded, 1);
        assert!(h.audit.stats().events_recorded >= 1);
    }

    #[tokio::test]
    async fn test_deadlock_retried_then_succeeds() {
        let h = harness();
        h.primary
            .script_error(GatewayError::Deadlock("mock deadlock".into()));
        let outcome = h
            .executor
            .exec("SELECT * FROM accounts", &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        // Both attempts reached the backend.
        assert_eq!(h.primary.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reads_route_replica_writes_route_primary() {
        let h = harness_with(1, SecurityConfig::default(), 0.0);

        h.executor.exec("SELECT 1 FROM t", &[], None).await.unwrap();
        assert_eq!(h.replicas[0].queries.load(Ordering::SeqCst), 1);
        assert_eq!(h.primary.queries.load(Ordering::SeqCst), 0);

        h.executor
            .exec("INSERT INTO t (a) VALUES (?)", &[json!(1)], None)
            .await
            .unwrap();
        assert_eq!(h.primary.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rbac_denied_without_permission() {
        let h = harness();
        h.rbac.create_user("bob", "Bob").unwrap();
        let err = h
            .executor
            .exec("SELECT * FROM secrets", &[], Some("bob"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "access-denied");
        assert_eq!(h.primary.connects.load(Ordering::SeqCst), 0);
        assert_eq!(h.limiter.stats().refunded, 1);

        // Granting the scoped permission unlocks the query.
        h.rbac.create_role("reader", "Reader").unwrap();
        h.rbac.assign_permission("reader", "SELECT:secrets").unwrap();
        h.rbac.assign_role("bob", "reader").unwrap();
        assert!(h
            .executor
            .exec("SELECT * FROM secrets", &[], Some("bob"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rate_limited_rejection() {
        let security = SecurityConfig {
            rate_limit_max: 1,
            rate_limit_window: Duration::from_secs(60),
            ..SecurityConfig::default()
        };
        let h = harness_with(0, security, 0.0);
        assert!(h.executor.exec("SELECT 1 FROM a", &[], None).await.is_ok());
        let err = h.executor.exec("SELECT 1 FROM b", &[], None).await.unwrap_err();
        assert_eq!(err.category(), "rate-limited");
    }

    #[tokio::test]
    async fn test_result_truncation_and_redaction() {
        let security = SecurityConfig {
            max_result_rows: 2,
            ..SecurityConfig::default()
        };
        let h = harness_with(0, security, 0.0);
        let sql = "SELECT * FROM accounts";
        h.primary.set_rows(
            sql,
            vec![
                json!({"id": 1, "password": "hunter2"}),
                json!({"id": 2, "password": "hunter2"}),
                json!({"id": 3, "password": "hunter2"}),
            ],
        );

        let outcome = h.executor.exec(sql, &[], None).await.unwrap();
        assert!(outcome.truncated);
        let rows = outcome.rows.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["password"], "***");
    }

    #[tokio::test]
    async fn test_batch_exec_commits_in_order_and_invalidates() {
        let h = harness();
        // Seed a cached read that the batch must invalidate.
        let read = "SELECT id FROM users";
        h.primary.set_rows(read, vec![json!({"id": 1})]);
        h.executor.exec(read, &[], None).await.unwrap();
        assert!(h.cache.query().lookup(read, &[]).is_some());

        let queries = vec![
            ("INSERT INTO users (id) VALUES (?)".to_string(), vec![json!(2)]),
            ("UPDATE users SET name = ? WHERE id = ?".to_string(), vec![json!("n"), json!(2)]),
        ];
        let outcomes = h.executor.batch_exec(&queries, None).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].affected_rows, 1);

        let executed = h.primary.executed_statements();
        let begin_pos = executed.iter().position(|s| s == "START TRANSACTION").unwrap();
        let commit_pos = executed.iter().position(|s| s == "COMMIT").unwrap();
        assert!(begin_pos < commit_pos);
        // Statements ran in input order inside the transaction.
        let insert_pos = executed.iter().position(|s| s.starts_with("INSERT")).unwrap();
        let update_pos = executed.iter().position(|s| s.starts_with("UPDATE")).unwrap();
        assert!(begin_pos < insert_pos && insert_pos < update_pos && update_pos < commit_pos);

        assert!(h.cache.query().lookup(read, &[]).is_none());
    }

    #[tokio::test]
    async fn test_batch_exec_serves_cached_reads_inside_transaction() {
        let h = harness();
        let read = "SELECT id FROM users";
        h.primary.set_rows(read, vec![json!({"id": 1})]);
        h.executor.exec(read, &[], None).await.unwrap();
        let select_runs = |state: &MockState| {
            state
                .executed_statements()
                .iter()
                .filter(|s| *s == read)
                .count()
        };
        assert_eq!(select_runs(&h.primary), 1);

        // The read is satisfied from cache; only the insert executes.
        let queries = vec![
            (read.to_string(), vec![]),
            ("INSERT INTO audit_log (id) VALUES (?)".to_string(), vec![json!(1)]),
        ];
        let outcomes = h.executor.batch_exec(&queries, None).await.unwrap();
        assert!(outcomes[0].from_cache);
        assert_eq!(outcomes[0].rows.as_ref().unwrap().len(), 1);
        assert_eq!(outcomes[1].affected_rows, 1);
        assert_eq!(select_runs(&h.primary), 1);
        // The insert touched a different table; the entry survives.
        assert!(h.cache.query().lookup(read, &[]).is_some());
    }

    #[tokio::test]
    async fn test_batch_exec_stores_fresh_reads_and_skips_pool_when_all_cached() {
        let h = harness();
        let read = "SELECT id FROM fresh_t";
        h.primary.set_rows(read, vec![json!({"id": 7})]);

        // A fresh read inside a batch executes and populates the cache.
        let queries = vec![(read.to_string(), Vec::new())];
        let outcomes = h.executor.batch_exec(&queries, None).await.unwrap();
        assert!(!outcomes[0].from_cache);
        assert!(h.cache.query().lookup(read, &[]).is_some());
        assert_eq!(h.primary.begins.load(Ordering::SeqCst), 1);

        // A batch made entirely of cached reads never opens a
        // transaction or touches the pool.
        let outcomes = h.executor.batch_exec(&queries, None).await.unwrap();
        assert!(outcomes[0].from_cache);
        assert_eq!(outcomes[0].rows.as_ref().unwrap()[0]["id"], 7);
        assert_eq!(h.primary.begins.load(Ordering::SeqCst), 1);

        // A follow-up plain exec also hits the batch-stored entry.
        let again = h.executor.exec(read, &[], None).await.unwrap();
        assert!(again.from_cache);
    }

    #[tokio::test]
    async fn test_batch_exec_read_of_mutated_table_is_not_kept() {
        let h = harness();
        let read = "SELECT id FROM users";
        h.primary.set_rows(read, vec![json!({"id": 1})]);

        let queries = vec![
            (read.to_string(), vec![]),
            ("UPDATE users SET name = ? WHERE id = ?".to_string(), vec![json!("n"), json!(1)]),
        ];
        let outcomes = h.executor.batch_exec(&queries, None).await.unwrap();
        assert!(!outcomes[0].from_cache);
        // The read ran before the update inside the transaction, so
        // its rows are stale by commit time and must not be served.
        assert!(h.cache.query().lookup(read, &[]).is_none());
    }

    #[tokio::test]
    async fn test_batch_exec_rolls_back_and_surfaces_first_error() {
        let h = harness();
        let bad = "UPDATE users SET broken = ?";
        h.primary.fail_sql.lock().insert(
            bad.to_string(),
            GatewayError::Syntax("bad column".into()),
        );

        let queries = vec![
            ("INSERT INTO users (id) VALUES (?)".to_string(), vec![json!(1)]),
            (bad.to_string(), vec![json!(1)]),
        ];
        let err = h.executor.batch_exec(&queries, None).await.unwrap_err();
        assert_eq!(err.category(), "syntax-error");

        let executed = h.primary.executed_statements();
        assert!(executed.iter().any(|s| s == "ROLLBACK"));
        assert!(!executed.iter().any(|s| s == "COMMIT"));
    }

    #[tokio::test]
    async fn test_batch_insert_chunks_with_per_batch_transactions() {
        let h = harness();
        let rows: Vec<Vec<Value>> = (0..25).map(|i| vec![json!(i), json!("name")]).collect();
        let columns = vec!["id".to_string(), "name".to_string()];

        // 25 rows fit one batch at the default size.
        let outcome = h
            .executor
            .batch_insert("users", &columns, &rows, None)
            .await
            .unwrap();
        assert_eq!(outcome.batches, 1);
        assert_eq!(h.primary.begins.load(Ordering::SeqCst), 1);
        assert_eq!(h.primary.commits.load(Ordering::SeqCst), 1);

        let executed = h.primary.executed_statements();
        let insert = executed.iter().find(|s| s.starts_with("INSERT")).unwrap();
        assert!(insert.starts_with("INSERT INTO `users` (`id`, `name`) VALUES"));
        assert_eq!(insert.matches("(?, ?)").count(), 25);
    }

    #[tokio::test]
    async fn test_batch_insert_splits_under_pressure() {
        // Pressure 0.9 -> batch size floor (50); 120 rows -> 3 batches.
        let h = harness_with(0, SecurityConfig::default(), 0.9);
        let rows: Vec<Vec<Value>> = (0..120).map(|i| vec![json!(i)]).collect();
        let columns = vec!["id".to_string()];

        let outcome = h
            .executor
            .batch_insert("events", &columns, &rows, None)
            .await
            .unwrap();
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.affected, 3); // mock reports 1 per statement
        assert_eq!(h.primary.commits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_batch_insert_rejects_bad_identifiers() {
        let h = harness();
        let rows = vec![vec![json!(1)]];
        let err = h
            .executor
            .batch_insert("users; DROP TABLE x", &["id".to_string()], &rows, None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "validation-error");

        let err = h
            .executor
            .batch_insert("users", &["bad-col".to_string()], &rows, None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "validation-error");
        assert_eq!(h.primary.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_metrics_reflect_pipeline() {
        let h = harness();
        let sql = "SELECT id FROM metrics_t";
        h.primary.set_rows(sql, vec![json!({"id": 1})]);
        h.executor.exec(sql, &[], None).await.unwrap();
        h.executor.exec(sql, &[], None).await.unwrap();
        let _ = h
            .executor
            .exec("SELECT * FROM t WHERE x='1' OR '1'='1'", &[], None)
            .await;

        let snap = h.executor.metrics().snapshot();
        assert_eq!(snap.queries_total, 3);
        assert_eq!(snap.queries_failed, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.errors_by_category["security-violation"], 1);
    }
}
