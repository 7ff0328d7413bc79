//! Relational driver.
//!
//! Script writes `?` placeholders; they are rewritten to the dialect's form
//! before execution. `sqlite` runs in-process through rusqlite. Other
//! dialects run through a registered [`SqlConnector`]; a dialect without one
//! fails the call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::types::{Value as SqlLiteValue, ValueRef};
use rusqlite::Connection;
use serde_json::{Map, Value};
use switchyard_error::CallError;
use switchyard_model::BackendKind;

use crate::descriptor::{SqlRequest, SqlStatement, SqlValue};
use crate::{BackendRequest, Driver};

/// Output of one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlOutput {
    /// Result rows, column name to value.
    Rows(Vec<Map<String, Value>>),
    /// Effect of a data-changing statement.
    Affected {
        /// Rows changed.
        rows_affected: u64,
        /// Last inserted row id, when the dialect reports one.
        insert_id: Option<i64>,
    },
}

/// Executes statements for one or more SQL dialects.
#[async_trait::async_trait]
pub trait SqlConnector: Send + Sync {
    /// Run `statement` (placeholders already rewritten) with the request's
    /// parameters against the endpoint described by `connection`.
    async fn run(
        &self,
        request: &SqlRequest,
        statement: &str,
        connection: &Value,
    ) -> Result<SqlOutput, CallError>;
}

/// Rewrite `?` placeholders outside string literals for the dialect.
pub fn rewrite_placeholders(dialect: BackendKind, sql: &str) -> String {
    let style: fn(usize) -> String = match dialect {
        BackendKind::Postgres => |n| format!("${n}"),
        BackendKind::SqlServer => |n| format!("@P{n}"),
        BackendKind::Oracle => |n| format!(":{n}"),
        _ => return sql.to_string(),
    };
    let mut out = String::with_capacity(sql.len() + 8);
    let mut quote: Option<char> = None;
    let mut n = 0;
    for c in sql.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '?' => {
                n += 1;
                out.push_str(&style(n));
            }
            None => out.push(c),
        }
    }
    out
}

/// In-process SQLite, one connection per database path.
#[derive(Default)]
pub struct SqliteConnector {
    connections: Mutex<HashMap<String, Arc<Mutex<Connection>>>>,
}

impl SqliteConnector {
    fn connection(&self, path: &str) -> Result<Arc<Mutex<Connection>>, CallError> {
        let mut pool = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = pool.get(path) {
            return Ok(conn.clone());
        }
        let conn = Connection::open(path)
            .map_err(|e| CallError::upstream("sqlite", format!("cannot open database: {e}")))?;
        let conn = Arc::new(Mutex::new(conn));
        pool.insert(path.to_string(), conn.clone());
        Ok(conn)
    }
}

fn to_sqlite(value: &SqlValue) -> SqlLiteValue {
    match value {
        SqlValue::Null => SqlLiteValue::Null,
        SqlValue::Int(i) => SqlLiteValue::Integer(*i),
        SqlValue::Float(f) => SqlLiteValue::Real(*f),
        SqlValue::Bool(b) => SqlLiteValue::Integer(i64::from(*b)),
        SqlValue::Text(s) => SqlLiteValue::Text(s.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
    }
}

fn run_sqlite(
    conn: &Connection,
    statement: &SqlStatement,
    sql: &str,
    params: &[SqlLiteValue],
) -> rusqlite::Result<SqlOutput> {
    match statement {
        SqlStatement::Query(_) => {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Map::new();
                for (i, name) in columns.iter().enumerate() {
                    record.insert(name.clone(), from_sqlite(row.get_ref(i)?));
                }
                out.push(record);
            }
            Ok(SqlOutput::Rows(out))
        }
        SqlStatement::Execute(_) => {
            let changed = conn.execute(sql, rusqlite::params_from_iter(params.iter()))?;
            Ok(SqlOutput::Affected {
                rows_affected: changed as u64,
                insert_id: Some(conn.last_insert_rowid()),
            })
        }
    }
}

#[async_trait::async_trait]
impl SqlConnector for SqliteConnector {
    async fn run(
        &self,
        request: &SqlRequest,
        statement: &str,
        connection: &Value,
    ) -> Result<SqlOutput, CallError> {
        let path = connection
            .get("database")
            .or_else(|| connection.get("file"))
            .and_then(Value::as_str)
            .unwrap_or(":memory:");
        let conn = self.connection(path)?;
        let kind = request.statement.clone();
        let sql = statement.to_string();
        let params: Vec<SqlLiteValue> = request.parameters.iter().map(to_sqlite).collect();
        let transactional = request.transactional;

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            if transactional {
                let tx = conn.transaction()?;
                let out = run_sqlite(&tx, &kind, &sql, &params)?;
                tx.commit()?;
                Ok(out)
            } else {
                run_sqlite(&conn, &kind, &sql, &params)
            }
        })
        .await
        .map_err(|e| CallError::Internal(anyhow::anyhow!("sqlite task failed: {e}")))?
        .map_err(|e: rusqlite::Error| CallError::upstream("sqlite", e.to_string()))
    }
}

/// Relational driver for every SQL dialect.
pub struct SqlDriver {
    sqlite: SqliteConnector,
    connectors: HashMap<BackendKind, Arc<dyn SqlConnector>>,
}

impl SqlDriver {
    /// A driver with in-process SQLite and no external connectors.
    pub fn new() -> Self {
        Self {
            sqlite: SqliteConnector::default(),
            connectors: HashMap::new(),
        }
    }

    /// Register a connector for a dialect.
    pub fn with_connector(mut self, dialect: BackendKind, connector: Arc<dyn SqlConnector>) -> Self {
        self.connectors.insert(dialect, connector);
        self
    }

    async fn run(&self, req: SqlRequest, connection: &Value) -> Result<Value, CallError> {
        let raw = match &req.statement {
            SqlStatement::Query(s) | SqlStatement::Execute(s) => s.clone(),
        };
        let statement = rewrite_placeholders(req.dialect, &raw);
        let output = match req.dialect {
            BackendKind::Sqlite => self.sqlite.run(&req, &statement, connection).await?,
            dialect => {
                let connector = self.connectors.get(&dialect).ok_or_else(|| {
                    CallError::upstream(
                        dialect.as_str(),
                        format!("no connector configured for dialect {dialect}"),
                    )
                })?;
                connector.run(&req, &statement, connection).await?
            }
        };

        Ok(match output {
            SqlOutput::Rows(rows) => {
                let data: Vec<Value> = rows
                    .into_iter()
                    .map(|mut row| {
                        for (column, ty) in &req.result_types {
                            if let Some(v) = row.get_mut(column) {
                                *v = ty.coerce(v.take());
                            }
                        }
                        Value::Object(row)
                    })
                    .collect();
                serde_json::json!({ "data": data })
            }
            SqlOutput::Affected {
                rows_affected,
                insert_id,
            } => serde_json::json!({
                "rowsAffected": rows_affected,
                "insertId": insert_id,
            }),
        })
    }
}

impl Default for SqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Driver for SqlDriver {
    async fn execute(&self, request: BackendRequest, connection: &Value) -> Result<Value, CallError> {
        match request {
            BackendRequest::Sql(req) => self.run(req, connection).await,
            other => Err(CallError::invalid(
                "sql",
                format!("cannot execute a {} request", other.kind()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> BackendRequest {
        BackendRequest::parse(BackendKind::Sqlite, &v).unwrap()
    }

    #[test]
    fn placeholders_per_dialect() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = '?' AND c = ?";
        assert_eq!(
            rewrite_placeholders(BackendKind::Postgres, sql),
            "SELECT * FROM t WHERE a = $1 AND b = '?' AND c = $2"
        );
        assert_eq!(
            rewrite_placeholders(BackendKind::SqlServer, sql),
            "SELECT * FROM t WHERE a = @P1 AND b = '?' AND c = @P2"
        );
        assert_eq!(
            rewrite_placeholders(BackendKind::Oracle, sql),
            "SELECT * FROM t WHERE a = :1 AND b = '?' AND c = :2"
        );
        assert_eq!(rewrite_placeholders(BackendKind::MySql, sql), sql);
    }

    #[tokio::test]
    async fn sqlite_execute_then_query_with_result_types() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let conn = json!({ "database": db.to_str().unwrap() });
        let driver = SqlDriver::new();

        driver
            .execute(
                parse(json!({"executeStatement": "CREATE TABLE t (id INTEGER PRIMARY KEY, n TEXT, flag INTEGER)"})),
                &conn,
            )
            .await
            .unwrap();
        let inserted = driver
            .execute(
                parse(json!({
                    "executeStatement": "INSERT INTO t (n, flag) VALUES (?, ?)",
                    "parameters": ["12", true],
                    "transactions": true
                })),
                &conn,
            )
            .await
            .unwrap();
        assert_eq!(inserted["rowsAffected"], 1);
        assert_eq!(inserted["insertId"], 1);

        let rows = driver
            .execute(
                parse(json!({
                    "queryStatement": "SELECT n, flag FROM t WHERE id = ?",
                    "parameters": [{"_type": "Converter", "value": "1", "convertTo": "int64"}],
                    "resultTypes": {"n": "int64", "flag": "bool"}
                })),
                &conn,
            )
            .await
            .unwrap();
        assert_eq!(rows["data"], json!([{"n": 12, "flag": true}]));
    }

    #[tokio::test]
    async fn sqlite_errors_are_upstream_failures() {
        let driver = SqlDriver::new();
        let err = driver
            .execute(parse(json!({"queryStatement": "SELECT * FROM missing"})), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }

    #[tokio::test]
    async fn dialect_without_connector_fails_cleanly() {
        let driver = SqlDriver::new();
        let req = BackendRequest::parse(BackendKind::Postgres, &json!({"queryStatement": "SELECT 1"}))
            .unwrap();
        let err = driver.execute(req, &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("no connector"), "{err}");
    }

    struct RecordingConnector(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl SqlConnector for RecordingConnector {
        async fn run(
            &self,
            _request: &SqlRequest,
            statement: &str,
            _connection: &Value,
        ) -> Result<SqlOutput, CallError> {
            self.0.lock().unwrap().push(statement.to_string());
            Ok(SqlOutput::Rows(vec![]))
        }
    }

    #[tokio::test]
    async fn external_connector_sees_rewritten_statement() {
        let connector = Arc::new(RecordingConnector(Mutex::new(vec![])));
        let driver = SqlDriver::new().with_connector(BackendKind::Postgres, connector.clone());
        let req = BackendRequest::parse(
            BackendKind::Postgres,
            &json!({"queryStatement": "SELECT ? , ?", "parameters": [1, 2]}),
        )
        .unwrap();
        let out = driver.execute(req, &json!({})).await.unwrap();
        assert_eq!(out["data"], json!([]));
        assert_eq!(connector.0.lock().unwrap()[0], "SELECT $1 , $2");
    }
}
