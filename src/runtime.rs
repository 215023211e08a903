// # Gateway Runtime
//
// The single wired value handed to tool adapters: configuration,
// memory controller, caches, security, rate limiting, pool and
// executor, assembled at startup and torn down deterministically by
// `close()`. No process-wide mutable globals.

use crate::audit::AuditSink;
use crate::backend::mysql::MySqlConnector;
use crate::backend::Connector;
use crate::cache::{CacheManager, WarmupLoader};
use crate::config::{ConfigStore, GatewayConfig};
use crate::error::{GatewayError, Result, Severity};
use crate::executor::{
    is_valid_identifier, Authorizer, ConnectionProvider, ExecutorConfig, ExecutorMetrics,
    LoadProbe, QueryExecutor, RateLimiter,
};
use crate::memory::PressureController;
use crate::pool::{SessionManager, SessionManagerConfig};
use crate::ratelimit::AdaptiveRateLimiter;
use crate::retry::{RetryPolicy, SmartRetry};
use crate::security::validator::{InputValidator, SqlValidator};
use crate::security::{PatternDetector, RbacAuthorizer};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Warm-up loader backed by the read pool.
struct PoolWarmupLoader {
    pool: Arc<SessionManager>,
}

#[async_trait]
impl WarmupLoader for PoolWarmupLoader {
    async fn table_schema(&self, table: &str) -> Result<Value> {
        if !is_valid_identifier(table) {
            return Err(GatewayError::Validation(format!(
                "invalid table name: {table}"
            )));
        }
        let mut handle = self.pool.get_read(Some("warmup".to_string())).await?;
        let outcome = handle
            .query(&format!("SHOW COLUMNS FROM `{table}`"), &[])
            .await?;
        Ok(Value::Array(outcome.rows))
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut handle = self.pool.get_read(Some("warmup".to_string())).await?;
        let outcome = handle
            .query("SHOW TABLES LIKE ?", &[json!(table)])
            .await?;
        Ok(!outcome.rows.is_empty())
    }
}

/// The assembled gateway core.
pub struct Runtime {
    config_store: Arc<ConfigStore>,
    audit: Arc<AuditSink>,
    pressure: Arc<PressureController>,
    cache: Arc<CacheManager>,
    rbac: Arc<RbacAuthorizer>,
    limiter: Arc<AdaptiveRateLimiter>,
    pool: Arc<SessionManager>,
    executor: Arc<QueryExecutor>,
}

impl Runtime {
    /// Build against MySQL endpoints from the configuration.
    pub fn connect(config: GatewayConfig, state_dir: Option<PathBuf>) -> Result<Arc<Self>> {
        config.validate()?;
        let primary: Arc<dyn Connector> = Arc::new(MySqlConnector::primary(
            &config.database,
            config.security.query_timeout,
        ));
        let replicas: Vec<Arc<dyn Connector>> = config
            .database
            .replicas
            .iter()
            .map(|replica| {
                Arc::new(MySqlConnector::replica(
                    &config.database,
                    &replica.host,
                    replica.port,
                    config.security.query_timeout,
                )) as Arc<dyn Connector>
            })
            .collect();
        Ok(Self::with_backend(config, primary, replicas, state_dir))
    }

    /// Build over explicit connectors; the test entry point and the
    /// seam for alternative drivers.
    pub fn with_backend(
        config: GatewayConfig,
        primary: Arc<dyn Connector>,
        replicas: Vec<Arc<dyn Connector>>,
        state_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        let audit = match &state_dir {
            Some(dir) => Arc::new(AuditSink::new(dir)),
            None => Arc::new(AuditSink::disabled()),
        };
        let stats_path = state_dir.map(|dir| dir.join("pool_stats.json"));

        let pressure = Arc::new(PressureController::new(
            config.memory.clone(),
            Arc::clone(&audit),
        ));
        let cache = Arc::new(CacheManager::new(&config.cache));
        let rbac = Arc::new(RbacAuthorizer::new());
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            &config.security,
            Arc::clone(&audit),
        ));
        let pool = SessionManager::new(
            SessionManagerConfig::from_database(&config.database, stats_path),
            primary,
            replicas,
            Arc::clone(&audit),
        );

        // Pressure flows to every consumer that sheds load.
        pressure.subscribe(Arc::clone(&cache) as Arc<dyn crate::memory::PressureSubscriber>);
        pressure.subscribe(Arc::clone(&limiter) as Arc<dyn crate::memory::PressureSubscriber>);
        pressure.subscribe(Arc::clone(&pool) as Arc<dyn crate::memory::PressureSubscriber>);

        let detector = Arc::new(PatternDetector::new());
        let sql_validator = Arc::new(SqlValidator::new(
            &config.security,
            Arc::clone(&detector),
            Arc::clone(&audit),
        ));
        let input_validator = Arc::new(InputValidator::new(
            &config.security,
            Arc::clone(&detector),
            Arc::clone(&audit),
        ));
        let basic_security = crate::config::SecurityConfig {
            validation_level: crate::config::ValidationLevel::Basic,
            ..config.security.clone()
        };
        let basic_validator = Arc::new(InputValidator::new(
            &basic_security,
            Arc::clone(&detector),
            Arc::clone(&audit),
        ));

        let executor = Arc::new(QueryExecutor::new(
            ExecutorConfig::from_security(&config.security),
            sql_validator,
            input_validator,
            basic_validator,
            Arc::clone(&rbac) as Arc<dyn Authorizer>,
            Arc::clone(&limiter) as Arc<dyn RateLimiter>,
            Arc::clone(&cache),
            Arc::clone(&pool) as Arc<dyn ConnectionProvider>,
            SmartRetry::new(RetryPolicy::default()),
            Arc::clone(&pressure) as Arc<dyn LoadProbe>,
            Arc::new(ExecutorMetrics::new()),
        ));

        let config_store = Arc::new(ConfigStore::new(config));
        Arc::new(Self {
            config_store,
            audit,
            pressure,
            cache,
            rbac,
            limiter,
            pool,
            executor,
        })
    }

    /// Spawn the background loops (memory sampler, health checker,
    /// leak detector, stats saver).
    pub fn start(self: &Arc<Self>) {
        self.pressure.start();
        self.pool.start();
        tracing::info!(component = "runtime", "gateway runtime started");
    }

    /// Prefetch schema facts for the given tables without blocking the
    /// caller; progress and failures are logged.
    pub fn warm_up(self: &Arc<Self>, tables: Vec<String>) {
        if tables.is_empty() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let loader = Arc::new(PoolWarmupLoader {
            pool: Arc::clone(&self.pool),
        });
        tokio::spawn(async move {
            let report = cache.warm_up(&tables, loader).await;
            tracing::info!(
                component = "runtime",
                warmed = report.warmed,
                failed = report.failed,
                "cache warm-up finished"
            );
        });
    }

    pub fn executor(&self) -> Arc<QueryExecutor> {
        Arc::clone(&self.executor)
    }

    pub fn rbac(&self) -> Arc<RbacAuthorizer> {
        Arc::clone(&self.rbac)
    }

    pub fn cache(&self) -> Arc<CacheManager> {
        Arc::clone(&self.cache)
    }

    pub fn pool(&self) -> Arc<SessionManager> {
        Arc::clone(&self.pool)
    }

    pub fn pressure(&self) -> Arc<PressureController> {
        Arc::clone(&self.pressure)
    }

    pub fn config(&self) -> Arc<ConfigStore> {
        Arc::clone(&self.config_store)
    }

    /// Diagnostics snapshot across every subsystem.
    pub fn status(&self) -> Value {
        json!({
            "config_version": self.config_store.version(),
            "pool": self.pool.snapshot(),
            "cache": self.cache.stats(),
            "memory": self.pressure.latest(),
            "metrics": self.executor.metrics().snapshot(),
            "rate_limiter": self.limiter.stats(),
            "audit": self.audit.stats(),
        })
    }

    /// Stop intake-side loops, persist final pool stats and drain
    /// connections. Deterministic: awaits every background task.
    pub async fn close(&self) {
        self.pressure.close().await;
        self.pool.close().await;
        self.audit
            .record("shutdown", Severity::Info, json!({ "clean": true }));
        tracing::info!(component = "runtime", "gateway runtime closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockConnector, MockState};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn runtime_with_mock() -> (Arc<Runtime>, Arc<MockState>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let state = MockState::new();
        let primary = Arc::new(MockConnector::new("primary", false, Arc::clone(&state)));
        let runtime = Runtime::with_backend(GatewayConfig::default(), primary, vec![], None);
        (runtime, state)
    }

    #[tokio::test]
    async fn test_end_to_end_exec_through_runtime() {
        let (runtime, state) = runtime_with_mock();
        state.set_rows("SELECT id FROM users", vec![json!({"id": 1})]);

        let outcome = runtime
            .executor()
            .exec("SELECT id FROM users", &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.row_count, 1);
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_status_snapshot_shape() {
        let (runtime, _state) = runtime_with_mock();
        let status = runtime.status();
        assert!(status["pool"]["cap"].as_u64().unwrap() >= 1);
        assert!(status["config_version"].as_u64().unwrap() >= 1);
        assert!(status.get("cache").is_some());
        assert!(status.get("metrics").is_some());
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_warm_up_populates_regions() {
        let (runtime, state) = runtime_with_mock();
        state.set_rows(
            "SHOW COLUMNS FROM `users`",
            vec![json!({"Field": "id", "Type": "int"})],
        );
        state.set_rows("SHOW TABLES LIKE ?", vec![json!({"Tables_in_db": "users"})]);

        runtime.warm_up(vec!["users".to_string()]);
        // Warm-up runs off the caller's path; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(runtime
            .cache()
            .get(crate::cache::CacheRegion::Schema, "users")
            .is_some());
        assert_eq!(
            runtime
                .cache()
                .get(crate::cache::CacheRegion::TableExists, "users"),
            Some(json!(true))
        );
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_pressure_reaches_pool_and_limiter() {
        let (runtime, _state) = runtime_with_mock();
        runtime
            .pressure()
            .ingest(crate::memory::MemorySnapshot::from_rss(900, 1000));
        // Fan-out spawns tasks; yield so they run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let status = runtime.status();
        // The limiter contracted its capacity under load; admitted
        // requests stay bounded at the 10% floor.
        let limiter = &status["rate_limiter"];
        assert_eq!(limiter["rejected"], 0);
        runtime.close().await;
    }

    #[tokio::test]
    async fn test_start_and_close_lifecycle() {
        let (runtime, state) = runtime_with_mock();
        runtime.start();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        runtime.close().await;
        // Health loop pinged at least once on its immediate first tick.
        assert!(state.pings.load(Ordering::SeqCst) >= 1);
    }
}
