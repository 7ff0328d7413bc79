//! SQL Server connector on tiberius.
//!
//! Endpoint data (optionally nested under `config`): `server`, `port`,
//! `user id`, `password`, `database` and `encrypt` (`true`, `false` or
//! `disable`). Each call opens its own TDS connection. Decimal and temporal
//! columns come back as null; cast them to text in the statement.

use serde_json::{Map, Value};
use switchyard_error::CallError;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::descriptor::{SqlRequest, SqlStatement, SqlValue};
use crate::drivers::sql::{SqlConnector, SqlOutput};

fn err(e: impl std::fmt::Display) -> CallError {
    CallError::upstream("sqlserver", e.to_string())
}

fn config(connection: &Value) -> Result<Config, CallError> {
    let cfg = connection.get("config").unwrap_or(connection);
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| cfg.get(*k).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
    };

    let mut config = Config::new();
    config.host(text(&["server", "host"]).unwrap_or("localhost"));
    config.port(
        cfg.get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(1433),
    );
    if let Some(db) = text(&["database", "dbname"]) {
        config.database(db);
    }
    if let Some(user) = text(&["user id", "user", "username"]) {
        config.authentication(AuthMethod::sql_server(user, text(&["password"]).unwrap_or("")));
    }
    let encrypt = match cfg.get("encrypt") {
        Some(Value::Bool(b)) => Some(if *b { "true" } else { "false" }),
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    };
    match encrypt {
        None | Some("false") => config.encryption(EncryptionLevel::Off),
        Some("true") => {
            config.encryption(EncryptionLevel::Required);
            config.trust_cert();
        }
        Some("disable") => config.encryption(EncryptionLevel::NotSupported),
        Some(other) => {
            return Err(CallError::invalid(
                "sqlserver",
                format!("unknown encrypt setting '{other}'"),
            ))
        }
    }
    Ok(config)
}

fn cell(data: ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|f| Value::from(f64::from(f))).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => v.map(|s| Value::String(s.into_owned())).unwrap_or(Value::Null),
        ColumnData::Guid(v) => v.map(|g| Value::String(g.to_string())).unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .map(|b| Value::Array(b.iter().map(|x| Value::from(*x)).collect()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

async fn connect(connection: &Value) -> Result<Client<Compat<TcpStream>>, CallError> {
    let config = config(connection)?;
    let tcp = TcpStream::connect(config.get_addr()).await.map_err(err)?;
    tcp.set_nodelay(true).map_err(err)?;
    Client::connect(config, tcp.compat_write()).await.map_err(err)
}

/// SQL Server through tiberius.
#[derive(Debug, Default)]
pub struct SqlServerConnector;

impl SqlServerConnector {
    /// A new connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl SqlConnector for SqlServerConnector {
    async fn run(
        &self,
        request: &SqlRequest,
        statement: &str,
        connection: &Value,
    ) -> Result<SqlOutput, CallError> {
        let mut client = connect(connection).await?;
        let mut query = Query::new(statement.to_string());
        for value in &request.parameters {
            match value {
                SqlValue::Null => query.bind(Option::<String>::None),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Bool(b) => query.bind(*b),
                SqlValue::Text(s) => query.bind(s.clone()),
            }
        }

        if request.transactional {
            client
                .simple_query("BEGIN TRANSACTION")
                .await
                .map_err(err)?
                .into_results()
                .await
                .map_err(err)?;
        }
        let output = match &request.statement {
            SqlStatement::Query(_) => {
                let rows = query
                    .query(&mut client)
                    .await
                    .map_err(err)?
                    .into_first_result()
                    .await
                    .map_err(err)?;
                SqlOutput::Rows(
                    rows.into_iter()
                        .map(|row| {
                            let names: Vec<String> =
                                row.columns().iter().map(|c| c.name().to_string()).collect();
                            names
                                .into_iter()
                                .zip(row.into_iter().map(cell))
                                .collect::<Map<String, Value>>()
                        })
                        .collect(),
                )
            }
            SqlStatement::Execute(_) => {
                let done = query.execute(&mut client).await.map_err(err)?;
                SqlOutput::Affected {
                    rows_affected: done.total(),
                    insert_id: None,
                }
            }
        };
        if request.transactional {
            client
                .simple_query("COMMIT TRANSACTION")
                .await
                .map_err(err)?
                .into_results()
                .await
                .map_err(err)?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_server_style_fields() {
        let config = config(&json!({"config": {
            "server": "mssql.internal", "port": 14330, "user id": "sa",
            "password": "pw", "database": "orders", "encrypt": "true"
        }}))
        .unwrap();
        assert_eq!(config.get_addr(), "mssql.internal:14330");
    }

    #[test]
    fn rejects_unknown_encrypt_setting() {
        let err = config(&json!({"server": "db", "encrypt": "maybe"})).unwrap_err();
        assert!(matches!(err, CallError::InvalidDescriptor { .. }));
        assert!(config(&json!({"encrypt": false})).is_ok());
    }

    #[test]
    fn cells_map_to_json() {
        assert_eq!(cell(ColumnData::I32(Some(7))), json!(7));
        assert_eq!(cell(ColumnData::Bit(Some(true))), json!(true));
        assert_eq!(cell(ColumnData::String(Some("x".into()))), json!("x"));
        assert_eq!(cell(ColumnData::I64(None)), Value::Null);
    }

    #[tokio::test]
    async fn unreachable_server_is_an_upstream_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = connect(&json!({"server": "127.0.0.1", "port": port}))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }
}
