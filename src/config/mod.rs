// # Configuration Store
//
// Typed, validated configuration snapshot for the gateway core. Loaded
// once from the environment at startup, replaced atomically on reload;
// subscribers detect drift through a version counter. Secrets are held
// in a type that redacts on stringification.

use crate::error::{GatewayError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Query verbs the allow-list may contain.
const KNOWN_QUERY_TYPES: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "SHOW", "DESCRIBE", "EXPLAIN", "CREATE", "ALTER",
    "DROP", "TRUNCATE", "REPLACE",
];

/// A credential that renders as `***` in every textual context.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// Access the underlying value; call sites are the audit trail.
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

/// How aggressively the input validator runs its pattern sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Strict,
    Moderate,
    Basic,
}

/// Address of a read replica.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaConfig {
    pub host: String,
    pub port: u16,
}

/// Database connectivity and pool sizing.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    pub database: String,
    /// Lower bound for the dynamic pool cap.
    pub pool_min: usize,
    /// Upper bound for the dynamic pool cap (env: CONNECTION_LIMIT).
    pub pool_max: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub ssl: bool,
    pub charset: String,
    pub timezone: String,
    /// Read replicas; empty means every query hits the primary.
    pub replicas: Vec<ReplicaConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: Secret::default(),
            database: "".to_string(),
            pool_min: 2,
            pool_max: 10,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            ssl: false,
            charset: "utf8mb4".to_string(),
            timezone: "+00:00".to_string(),
            replicas: Vec::new(),
        }
    }
}

/// Validation, rate limiting and result bounding.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityConfig {
    pub max_query_length: usize,
    pub max_input_length: usize,
    pub max_result_rows: usize,
    /// First-keyword allow-list, uppercase verbs.
    pub allowed_query_types: Vec<String>,
    pub query_timeout: Duration,
    pub rate_limit_max: u64,
    pub rate_limit_window: Duration,
    pub validation_level: ValidationLevel,
    /// Pattern-detector risk score above which a query is rejected.
    pub risk_threshold: u8,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_query_length: 10_000,
            max_input_length: 1_000,
            max_result_rows: 1_000,
            allowed_query_types: vec![
                "SELECT".to_string(),
                "INSERT".to_string(),
                "UPDATE".to_string(),
                "DELETE".to_string(),
                "SHOW".to_string(),
                "DESCRIBE".to_string(),
                "EXPLAIN".to_string(),
                "CREATE".to_string(),
                "ALTER".to_string(),
                "DROP".to_string(),
            ],
            query_timeout: Duration::from_secs(30),
            rate_limit_max: 100,
            rate_limit_window: Duration::from_secs(60),
            validation_level: ValidationLevel::Strict,
            risk_threshold: 60,
        }
    }
}

/// Region sizes, TTLs and query-cache tuning.
#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    pub schema_cache_size: usize,
    pub table_exists_cache_size: usize,
    pub index_cache_size: usize,
    pub cache_ttl: Duration,
    pub enable_query_cache: bool,
    pub query_cache_size: usize,
    pub query_cache_ttl: Duration,
    /// Serialized entries above this many bytes are not stored.
    pub max_query_result_bytes: usize,
    pub enable_tiered_cache: bool,
    pub enable_ttl_adjustment: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_cache_size: 128,
            table_exists_cache_size: 256,
            index_cache_size: 128,
            cache_ttl: Duration::from_secs(300),
            enable_query_cache: true,
            query_cache_size: 512,
            query_cache_ttl: Duration::from_secs(60),
            max_query_result_bytes: 1_048_576,
            enable_tiered_cache: true,
            enable_ttl_adjustment: false,
        }
    }
}

/// Memory-pressure controller tuning.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryConfig {
    pub monitoring_interval: Duration,
    pub history_size: usize,
    /// Pressure above which subscribers begin shrinking.
    pub pressure_threshold: f64,
    /// Pressure at which caches are cleared outright.
    pub cache_clear_threshold: f64,
    pub auto_gc: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(30),
            history_size: 100,
            pressure_threshold: 0.7,
            cache_clear_threshold: 0.85,
            auto_gc: true,
        }
    }
}

/// Immutable configuration bundle; replaced wholesale on reload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewayConfig {
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
}

impl GatewayConfig {
    /// Load from the process environment. Unrecognized keys are
    /// ignored; invalid values fail startup.
    pub fn from_env() -> Result<Self> {
        let mut cfg = GatewayConfig::default();

        if let Some(host) = read_env("MYSQL_HOST") {
            cfg.database.host = host;
        }
        if let Some(port) = parse_env::<u16>("MYSQL_PORT")? {
            cfg.database.port = port;
        }
        if let Some(user) = read_env("MYSQL_USER") {
            cfg.database.user = user;
        }
        if let Some(password) = read_env("MYSQL_PASSWORD") {
            cfg.database.password = Secret::new(password);
        }
        if let Some(db) = read_env("MYSQL_DATABASE") {
            cfg.database.database = db;
        }
        if let Some(limit) = parse_env::<usize>("MYSQL_CONNECTION_LIMIT")? {
            cfg.database.pool_max = limit;
        }
        if let Some(secs) = parse_env::<u64>("MYSQL_CONNECT_TIMEOUT")? {
            cfg.database.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("MYSQL_IDLE_TIMEOUT")? {
            cfg.database.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ssl) = parse_env::<bool>("MYSQL_SSL")? {
            cfg.database.ssl = ssl;
        }
        if let Some(charset) = read_env("MYSQL_CHARSET") {
            cfg.database.charset = charset;
        }
        if let Some(tz) = read_env("MYSQL_TIMEZONE") {
            cfg.database.timezone = tz;
        }

        if let Some(v) = parse_env::<usize>("MAX_QUERY_LENGTH")? {
            cfg.security.max_query_length = v;
        }
        if let Some(v) = parse_env::<usize>("MAX_INPUT_LENGTH")? {
            cfg.security.max_input_length = v;
        }
        if let Some(v) = parse_env::<usize>("MAX_RESULT_ROWS")? {
            cfg.security.max_result_rows = v;
        }
        if let Some(list) = read_env("ALLOWED_QUERY_TYPES") {
            cfg.security.allowed_query_types = list
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(secs) = parse_env::<u64>("QUERY_TIMEOUT")? {
            cfg.security.query_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = parse_env::<u64>("RATE_LIMIT_MAX")? {
            cfg.security.rate_limit_max = v;
        }
        if let Some(secs) = parse_env::<u64>("RATE_LIMIT_WINDOW")? {
            cfg.security.rate_limit_window = Duration::from_secs(secs);
        }

        if let Some(v) = parse_env::<usize>("SCHEMA_CACHE_SIZE")? {
            cfg.cache.schema_cache_size = v;
        }
        if let Some(v) = parse_env::<usize>("TABLE_EXISTS_CACHE_SIZE")? {
            cfg.cache.table_exists_cache_size = v;
        }
        if let Some(v) = parse_env::<usize>("INDEX_CACHE_SIZE")? {
            cfg.cache.index_cache_size = v;
        }
        if let Some(secs) = parse_env::<u64>("CACHE_TTL")? {
            cfg.cache.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(v) = parse_env::<bool>("ENABLE_QUERY_CACHE")? {
            cfg.cache.enable_query_cache = v;
        }
        if let Some(v) = parse_env::<usize>("QUERY_CACHE_SIZE")? {
            cfg.cache.query_cache_size = v;
        }
        if let Some(secs) = parse_env::<u64>("QUERY_CACHE_TTL")? {
            cfg.cache.query_cache_ttl = Duration::from_secs(secs);
        }
        if let Some(v) = parse_env::<usize>("MAX_QUERY_RESULT_SIZE")? {
            cfg.cache.max_query_result_bytes = v;
        }
        if let Some(v) = parse_env::<bool>("ENABLE_TIERED_CACHE")? {
            cfg.cache.enable_tiered_cache = v;
        }
        if let Some(v) = parse_env::<bool>("ENABLE_TTL_ADJUSTMENT")? {
            cfg.cache.enable_ttl_adjustment = v;
        }

        if let Some(secs) = parse_env::<u64>("MEMORY_MONITORING_INTERVAL")? {
            cfg.memory.monitoring_interval = Duration::from_secs(secs);
        }
        if let Some(v) = parse_env::<usize>("MEMORY_HISTORY_SIZE")? {
            cfg.memory.history_size = v;
        }
        if let Some(v) = parse_env::<f64>("MEMORY_PRESSURE_THRESHOLD")? {
            cfg.memory.pressure_threshold = v;
        }
        if let Some(v) = parse_env::<f64>("MEMORY_CACHE_CLEAR_THRESHOLD")? {
            cfg.memory.cache_clear_threshold = v;
        }
        if let Some(v) = parse_env::<bool>("MEMORY_AUTO_GC")? {
            cfg.memory.auto_gc = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.database.port == 0 {
            return Err(GatewayError::Configuration(
                "database port must be non-zero".to_string(),
            ));
        }
        if self.database.pool_min == 0 || self.database.pool_min > self.database.pool_max {
            return Err(GatewayError::Configuration(format!(
                "pool bounds invalid: min {} max {}",
                self.database.pool_min, self.database.pool_max
            )));
        }
        if self.security.max_query_length == 0 || self.security.max_input_length == 0 {
            return Err(GatewayError::Configuration(
                "query/input length limits must be positive".to_string(),
            ));
        }
        if self.security.allowed_query_types.is_empty() {
            return Err(GatewayError::Configuration(
                "allowed query types must not be empty".to_string(),
            ));
        }
        let known: HashSet<&str> = KNOWN_QUERY_TYPES.iter().copied().collect();
        for verb in &self.security.allowed_query_types {
            if !known.contains(verb.as_str()) {
                return Err(GatewayError::Configuration(format!(
                    "unknown query type in allow-list: {verb}"
                )));
            }
        }
        if self.security.rate_limit_window.is_zero() || self.security.rate_limit_max == 0 {
            return Err(GatewayError::Configuration(
                "rate limit window and max must be positive".to_string(),
            ));
        }
        if self.cache.schema_cache_size == 0
            || self.cache.table_exists_cache_size == 0
            || self.cache.index_cache_size == 0
            || self.cache.query_cache_size == 0
        {
            return Err(GatewayError::Configuration(
                "cache region sizes must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.memory.pressure_threshold)
            || !(0.0..=1.0).contains(&self.memory.cache_clear_threshold)
        {
            return Err(GatewayError::Configuration(
                "memory thresholds must lie in [0, 1]".to_string(),
            ));
        }
        if self.memory.history_size == 0 {
            return Err(GatewayError::Configuration(
                "memory history size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match read_env(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            GatewayError::Configuration(format!("invalid value for {key}: {raw}"))
        }),
    }
}

/// Shared handle to the current snapshot; swaps are whole-snapshot and
/// bump a version counter so subscribers can detect drift.
pub struct ConfigStore {
    current: RwLock<Arc<GatewayConfig>>,
    version: AtomicU64,
}

impl ConfigStore {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            version: AtomicU64::new(1),
        }
    }

    /// The live snapshot. Callers clone the `Arc` and read immutably.
    pub fn current(&self) -> Arc<GatewayConfig> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Validate and publish a replacement snapshot.
    pub fn reload(&self, config: GatewayConfig) -> Result<u64> {
        config.validate()?;
        *self.current.write() = Arc::new(config);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(component = "config", version, "configuration snapshot replaced");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_secret_redacts_on_display_and_debug() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret}"), "***");
        assert_eq!(format!("{secret:?}"), "***");
        assert_eq!(secret.reveal(), "hunter2");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"***\"");
    }

    #[test]
    fn test_validate_rejects_bad_pool_bounds() {
        let mut cfg = GatewayConfig::default();
        cfg.database.pool_min = 20;
        cfg.database.pool_max = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_verb() {
        let mut cfg = GatewayConfig::default();
        cfg.security.allowed_query_types = vec!["SELECT".to_string(), "GRANT".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let mut cfg = GatewayConfig::default();
        cfg.memory.pressure_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_store_swaps_and_bumps_version() {
        let store = ConfigStore::new(GatewayConfig::default());
        assert_eq!(store.version(), 1);
        let snapshot = store.current();
        assert_eq!(snapshot.database.port, 3306);

        let mut next = GatewayConfig::default();
        next.database.port = 3307;
        let version = store.reload(next).unwrap();
        assert_eq!(version, 2);
        assert_eq!(store.current().database.port, 3307);
        // The old snapshot is unaffected by the swap.
        assert_eq!(snapshot.database.port, 3306);
    }

    #[test]
    fn test_reload_rejects_invalid_snapshot() {
        let store = ConfigStore::new(GatewayConfig::default());
        let mut bad = GatewayConfig::default();
        bad.database.port = 0;
        assert!(store.reload(bad).is_err());
        assert_eq!(store.version(), 1);
    }
}
