//! PostgreSQL and MySQL connectors on sqlx pools.
//!
//! Endpoint data (optionally nested under `config`) follows each server's
//! usual field names: `host`/`server`, `port`, `user`/`username`,
//! `password`, `dbname`/`database`, plus `sslmode` for PostgreSQL. A `url`
//! field takes precedence over the separate fields. One lazily connected
//! pool is kept per distinct connection.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Row, ValueRef};
use switchyard_error::CallError;

use crate::descriptor::{SqlRequest, SqlStatement, SqlValue};
use crate::drivers::sql::{SqlConnector, SqlOutput};

/// Pool sizing shared by the pooled connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum open connections per distinct endpoint.
    pub max_connections: u32,
    /// How long a call waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection fields, with `config` nesting removed.
struct Fields<'a>(&'a Value);

impl<'a> Fields<'a> {
    fn of(connection: &'a Value) -> Self {
        Self(connection.get("config").unwrap_or(connection))
    }

    fn text(&self, keys: &[&str]) -> Option<&'a str> {
        keys.iter()
            .find_map(|k| self.0.get(*k).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
    }

    fn port(&self) -> Option<u16> {
        self.0
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
    }

    fn key(&self) -> String {
        self.0.to_string()
    }
}

fn pool_for<P: Clone>(
    pools: &Mutex<HashMap<String, P>>,
    key: String,
    open: impl FnOnce() -> Result<P, CallError>,
) -> Result<P, CallError> {
    let mut pools = pools.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(pool) = pools.get(&key) {
        return Ok(pool.clone());
    }
    let pool = open()?;
    pools.insert(key, pool.clone());
    Ok(pool)
}

fn upstream(backend: &str) -> impl Fn(sqlx::Error) -> CallError + '_ {
    move |e| CallError::upstream(backend, e.to_string())
}

macro_rules! bind_parameters {
    ($query:expr, $parameters:expr) => {{
        let mut query = $query;
        for value in $parameters {
            query = match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Bool(b) => query.bind(*b),
                SqlValue::Text(s) => query.bind(s.clone()),
            };
        }
        query
    }};
}

/// First decoding that the column's type accepts.
macro_rules! decode_cell {
    ($row:expr, $i:expr, $($ty:ty => $convert:expr),+ $(,)?) => {{
        let row = $row;
        let i = $i;
        let is_null = row.try_get_raw(i).map(|v| v.is_null()).unwrap_or(true);
        if is_null {
            Value::Null
        } $(else if let Ok(v) = row.try_get::<$ty, _>(i) {
            ($convert)(v)
        })+ else {
            let column = row.column(i);
            tracing::debug!(
                column = column.name(),
                type_name = %column.type_info(),
                "column type has no JSON mapping"
            );
            Value::Null
        }
    }};
}

fn pg_cell(row: &PgRow, i: usize) -> Value {
    decode_cell!(row, i,
        i64 => Value::from,
        i32 => Value::from,
        i16 => Value::from,
        f64 => Value::from,
        f32 => |v: f32| Value::from(f64::from(v)),
        bool => Value::Bool,
        String => Value::String,
        Value => |v| v,
        chrono::DateTime<chrono::Utc> => |v: chrono::DateTime<chrono::Utc>| Value::String(v.to_rfc3339()),
        chrono::NaiveDateTime => |v: chrono::NaiveDateTime| Value::String(v.to_string()),
        chrono::NaiveDate => |v: chrono::NaiveDate| Value::String(v.to_string()),
        uuid::Uuid => |v: uuid::Uuid| Value::String(v.to_string()),
        Vec<u8> => |v: Vec<u8>| Value::Array(v.into_iter().map(Value::from).collect()),
    )
}

fn mysql_cell(row: &MySqlRow, i: usize) -> Value {
    decode_cell!(row, i,
        i64 => Value::from,
        u64 => Value::from,
        f64 => Value::from,
        f32 => |v: f32| Value::from(f64::from(v)),
        String => Value::String,
        Value => |v| v,
        chrono::NaiveDateTime => |v: chrono::NaiveDateTime| Value::String(v.to_string()),
        chrono::NaiveDate => |v: chrono::NaiveDate| Value::String(v.to_string()),
        Vec<u8> => |v: Vec<u8>| Value::Array(v.into_iter().map(Value::from).collect()),
    )
}

fn records<R: Row>(rows: Vec<R>, cell: fn(&R, usize) -> Value) -> SqlOutput {
    SqlOutput::Rows(
        rows.iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, column)| (column.name().to_string(), cell(row, i)))
                    .collect::<Map<String, Value>>()
            })
            .collect(),
    )
}

/// PostgreSQL through sqlx.
#[derive(Default)]
pub struct PostgresConnector {
    settings: PoolSettings,
    pools: Mutex<HashMap<String, PgPool>>,
}

impl PostgresConnector {
    /// A connector with the given pool sizing.
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn options(fields: &Fields<'_>) -> Result<PgConnectOptions, CallError> {
        if let Some(url) = fields.text(&["url", "uri"]) {
            return PgConnectOptions::from_str(url)
                .map_err(|e| CallError::invalid("postgres", format!("bad url: {e}")));
        }
        let mut options = PgConnectOptions::new()
            .host(fields.text(&["host", "server"]).unwrap_or("localhost"))
            .port(fields.port().unwrap_or(5432));
        if let Some(user) = fields.text(&["user", "username"]) {
            options = options.username(user);
        }
        if let Some(password) = fields.text(&["password"]) {
            options = options.password(password);
        }
        if let Some(db) = fields.text(&["dbname", "database"]) {
            options = options.database(db);
        }
        if let Some(mode) = fields.text(&["sslmode"]) {
            let mode = PgSslMode::from_str(mode)
                .map_err(|e| CallError::invalid("postgres", format!("bad sslmode: {e}")))?;
            options = options.ssl_mode(mode);
        }
        Ok(options)
    }

    fn pool(&self, connection: &Value) -> Result<PgPool, CallError> {
        let fields = Fields::of(connection);
        pool_for(&self.pools, fields.key(), || {
            Ok(PgPoolOptions::new()
                .max_connections(self.settings.max_connections)
                .acquire_timeout(self.settings.acquire_timeout)
                .connect_lazy_with(Self::options(&fields)?))
        })
    }
}

#[async_trait::async_trait]
impl SqlConnector for PostgresConnector {
    async fn run(
        &self,
        request: &SqlRequest,
        statement: &str,
        connection: &Value,
    ) -> Result<SqlOutput, CallError> {
        let pool = self.pool(connection)?;
        let err = upstream("postgres");
        let query = bind_parameters!(sqlx::query(statement), &request.parameters);
        match (&request.statement, request.transactional) {
            (SqlStatement::Query(_), false) => {
                Ok(records(query.fetch_all(&pool).await.map_err(&err)?, pg_cell))
            }
            (SqlStatement::Query(_), true) => {
                let mut tx = pool.begin().await.map_err(&err)?;
                let rows = query.fetch_all(&mut *tx).await.map_err(&err)?;
                tx.commit().await.map_err(&err)?;
                Ok(records(rows, pg_cell))
            }
            (SqlStatement::Execute(_), transactional) => {
                let done = if transactional {
                    let mut tx = pool.begin().await.map_err(&err)?;
                    let done = query.execute(&mut *tx).await.map_err(&err)?;
                    tx.commit().await.map_err(&err)?;
                    done
                } else {
                    query.execute(&pool).await.map_err(&err)?
                };
                Ok(SqlOutput::Affected {
                    rows_affected: done.rows_affected(),
                    insert_id: None,
                })
            }
        }
    }
}

/// MySQL through sqlx.
#[derive(Default)]
pub struct MySqlConnector {
    settings: PoolSettings,
    pools: Mutex<HashMap<String, MySqlPool>>,
}

impl MySqlConnector {
    /// A connector with the given pool sizing.
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn options(fields: &Fields<'_>) -> Result<MySqlConnectOptions, CallError> {
        if let Some(url) = fields.text(&["url", "uri"]) {
            return MySqlConnectOptions::from_str(url)
                .map_err(|e| CallError::invalid("mysql", format!("bad url: {e}")));
        }
        let mut options = MySqlConnectOptions::new()
            .host(fields.text(&["server", "host"]).unwrap_or("localhost"))
            .port(fields.port().unwrap_or(3306));
        if let Some(user) = fields.text(&["username", "user"]) {
            options = options.username(user);
        }
        if let Some(password) = fields.text(&["password"]) {
            options = options.password(password);
        }
        if let Some(db) = fields.text(&["dbname", "database"]) {
            options = options.database(db);
        }
        Ok(options)
    }

    fn pool(&self, connection: &Value) -> Result<MySqlPool, CallError> {
        let fields = Fields::of(connection);
        pool_for(&self.pools, fields.key(), || {
            Ok(MySqlPoolOptions::new()
                .max_connections(self.settings.max_connections)
                .acquire_timeout(self.settings.acquire_timeout)
                .connect_lazy_with(Self::options(&fields)?))
        })
    }
}

#[async_trait::async_trait]
impl SqlConnector for MySqlConnector {
    async fn run(
        &self,
        request: &SqlRequest,
        statement: &str,
        connection: &Value,
    ) -> Result<SqlOutput, CallError> {
        let pool = self.pool(connection)?;
        let err = upstream("mysql");
        let query = bind_parameters!(sqlx::query(statement), &request.parameters);
        match (&request.statement, request.transactional) {
            (SqlStatement::Query(_), false) => {
                Ok(records(query.fetch_all(&pool).await.map_err(&err)?, mysql_cell))
            }
            (SqlStatement::Query(_), true) => {
                let mut tx = pool.begin().await.map_err(&err)?;
                let rows = query.fetch_all(&mut *tx).await.map_err(&err)?;
                tx.commit().await.map_err(&err)?;
                Ok(records(rows, mysql_cell))
            }
            (SqlStatement::Execute(_), transactional) => {
                let done = if transactional {
                    let mut tx = pool.begin().await.map_err(&err)?;
                    let done = query.execute(&mut *tx).await.map_err(&err)?;
                    tx.commit().await.map_err(&err)?;
                    done
                } else {
                    query.execute(&pool).await.map_err(&err)?
                };
                Ok(SqlOutput::Affected {
                    rows_affected: done.rows_affected(),
                    insert_id: i64::try_from(done.last_insert_id()).ok().filter(|id| *id != 0),
                })
            }
        }
    }
}
