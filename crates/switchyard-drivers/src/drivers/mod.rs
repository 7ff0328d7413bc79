//! Built-in backend drivers, one module per backend family.

mod docker;
mod http;
mod job;
mod key;
mod ldap;
mod mssql;
mod pooled_sql;
mod push;
mod redis;
mod smtp;
mod soap;
mod sql;
mod store;

pub use docker::DockerDriver;
pub use http::HttpDriver;
pub use job::{JobDriver, JobRunner};
pub use key::KeyDriver;
pub use ldap::LdapDriver;
pub use mssql::SqlServerConnector;
pub use pooled_sql::{MySqlConnector, PoolSettings, PostgresConnector};
pub use push::{PushDriver, PushProvider};
pub use self::redis::RedisDriver;
pub use smtp::SmtpDriver;
pub use soap::SoapDriver;
pub use sql::{rewrite_placeholders, SqlConnector, SqlDriver, SqlOutput, SqliteConnector};
pub use store::StoreDriver;
