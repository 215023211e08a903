// # MySQL Backend
//
// `Connector`/`Connection` implemented over mysql_async. Session init
// pins utf8mb4, disables multi-statements (driver default) and sets a
// server-side statement timeout matching the configured query timeout.

use super::{Connection, Connector, QueryOutcome};
use crate::config::DatabaseConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Row, SslOpts};
use serde_json::{json, Value};
use std::time::Duration;

/// Map a driver error into the gateway taxonomy.
fn map_driver_error(err: mysql_async::Error) -> GatewayError {
    match err {
        mysql_async::Error::Server(server) => {
            GatewayError::classify_mysql(server.code, &server.message)
        }
        mysql_async::Error::Io(io) => GatewayError::classify_mysql(0, &io.to_string()),
        other => GatewayError::classify_mysql(0, &other.to_string()),
    }
}

fn json_to_param(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::Int(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                mysql_async::Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                mysql_async::Value::UInt(u)
            } else {
                mysql_async::Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => mysql_async::Value::Bytes(s.clone().into_bytes()),
        // Structured parameters travel as their JSON text.
        other => mysql_async::Value::Bytes(other.to_string().into_bytes()),
    }
}

fn mysql_value_to_json(value: &mysql_async::Value) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::String(
                bytes
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<String>(),
            ),
        },
        mysql_async::Value::Int(i) => json!(i),
        mysql_async::Value::UInt(u) => json!(u),
        mysql_async::Value::Float(f) => json!(f),
        mysql_async::Value::Double(d) => json!(d),
        mysql_async::Value::Date(year, month, day, hour, minute, second, micros) => {
            Value::String(format!(
                "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
            ))
        }
        mysql_async::Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = u32::from(*hours) + days * 24;
            Value::String(format!(
                "{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    }
}

fn row_to_json(row: &Row) -> Value {
    let mut object = serde_json::Map::with_capacity(row.len());
    for (index, column) in row.columns_ref().iter().enumerate() {
        let value = row
            .as_ref(index)
            .map(mysql_value_to_json)
            .unwrap_or(Value::Null);
        object.insert(column.name_str().to_string(), value);
    }
    Value::Object(object)
}

/// Connector for one MySQL endpoint.
pub struct MySqlConnector {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: Option<String>,
    ssl: bool,
    charset: String,
    timezone: String,
    query_timeout: Duration,
    read_only: bool,
}

impl MySqlConnector {
    /// Connector for the primary endpoint.
    pub fn primary(config: &DatabaseConfig, query_timeout: Duration) -> Self {
        Self::for_endpoint(config, &config.host, config.port, query_timeout, false)
    }

    /// Connector for a replica endpoint; sessions are read-only.
    pub fn replica(config: &DatabaseConfig, host: &str, port: u16, query_timeout: Duration) -> Self {
        Self::for_endpoint(config, host, port, query_timeout, true)
    }

    fn for_endpoint(
        config: &DatabaseConfig,
        host: &str,
        port: u16,
        query_timeout: Duration,
        read_only: bool,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: config.user.clone(),
            password: config.password.reveal().to_string(),
            database: if config.database.is_empty() {
                None
            } else {
                Some(config.database.clone())
            },
            ssl: config.ssl,
            charset: config.charset.clone(),
            timezone: config.timezone.clone(),
            query_timeout,
            read_only,
        }
    }

    fn opts(&self) -> Opts {
        let timeout_ms = self.query_timeout.as_millis().max(1);
        let mut init = vec![
            format!("SET NAMES {}", self.charset),
            format!("SET time_zone = '{}'", self.timezone),
            format!("SET SESSION max_execution_time = {timeout_ms}"),
        ];
        if self.read_only {
            init.push("SET SESSION transaction_read_only = 1".to_string());
        }
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .prefer_socket(false)
            .tcp_nodelay(true)
            .init(init);
        if self.ssl {
            builder = builder.ssl_opts(Some(SslOpts::default()));
        }
        Opts::from(builder)
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = Conn::new(self.opts()).await.map_err(map_driver_error)?;
        Ok(Box::new(MySqlConnection { conn }))
    }

    async fn kill(&self, thread_id: u32) -> Result<()> {
        let mut side = Conn::new(self.opts()).await.map_err(map_driver_error)?;
        side.query_drop(format!("KILL QUERY {thread_id}"))
            .await
            .map_err(map_driver_error)?;
        side.disconnect().await.map_err(map_driver_error)?;
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// One live MySQL session.
pub struct MySqlConnection {
    conn: Conn,
}

#[async_trait]
impl Connection for MySqlConnection {
    fn thread_id(&self) -> u32 {
        self.conn.id()
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome> {
        let params = if params.is_empty() {
            Params::Empty
        } else {
            Params::Positional(params.iter().map(json_to_param).collect())
        };
        let rows: Vec<Row> = self
            .conn
            .exec(sql, params)
            .await
            .map_err(map_driver_error)?;
        if rows.is_empty() {
            // Statement produced no result set; report the write shape
            // with the id taken from the statement handle.
            Ok(QueryOutcome::affected(
                self.conn.affected_rows(),
                self.conn.last_insert_id(),
            ))
        } else {
            Ok(QueryOutcome::rows(rows.iter().map(row_to_json).collect()))
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await.map_err(map_driver_error)
    }

    async fn begin(&mut self) -> Result<()> {
        self.conn
            .query_drop("START TRANSACTION")
            .await
            .map_err(map_driver_error)
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn.query_drop("COMMIT").await.map_err(map_driver_error)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn
            .query_drop("ROLLBACK")
            .await
            .map_err(map_driver_error)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.disconnect().await.map_err(map_driver_error)
    }
}
