//! Backend type tags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The backend type a remote endpoint or call descriptor targets.
///
/// Every call descriptor carries exactly one of these tags. The serialized
/// form is the lowercase tag; the descriptive aliases used in configuration
/// (`document-store`, `directory`, ...) are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// HTTP services.
    Http,
    /// SOAP services.
    Soap,
    /// Microsoft SQL Server.
    #[serde(alias = "mssql")]
    SqlServer,
    /// MySQL / MariaDB.
    #[serde(alias = "mariadb")]
    MySql,
    /// PostgreSQL.
    #[serde(alias = "postgresql")]
    Postgres,
    /// SAP HANA.
    Hana,
    /// Oracle.
    Oracle,
    /// SQLite.
    Sqlite,
    /// JSON document store.
    #[serde(alias = "document-store", alias = "mongodb")]
    Store,
    /// Directory service.
    #[serde(alias = "directory")]
    Ldap,
    /// Key/value cache.
    #[serde(alias = "cache")]
    Redis,
    /// Mail delivery.
    #[serde(alias = "mail")]
    Smtp,
    /// Container execution.
    #[serde(alias = "container")]
    Docker,
    /// Job scheduling.
    Job,
    /// Key management.
    #[serde(alias = "key-management")]
    Key,
    /// Push notifications.
    Push,
}

impl BackendKind {
    /// All backend kinds, in tag order.
    pub const ALL: [BackendKind; 16] = [
        Self::Http,
        Self::Soap,
        Self::SqlServer,
        Self::MySql,
        Self::Postgres,
        Self::Hana,
        Self::Oracle,
        Self::Sqlite,
        Self::Store,
        Self::Ldap,
        Self::Redis,
        Self::Smtp,
        Self::Docker,
        Self::Job,
        Self::Key,
        Self::Push,
    ];

    /// The canonical tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Soap => "soap",
            Self::SqlServer => "sqlserver",
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::Hana => "hana",
            Self::Oracle => "oracle",
            Self::Sqlite => "sqlite",
            Self::Store => "store",
            Self::Ldap => "ldap",
            Self::Redis => "redis",
            Self::Smtp => "smtp",
            Self::Docker => "docker",
            Self::Job => "job",
            Self::Key => "key",
            Self::Push => "push",
        }
    }

    /// Whether this is one of the relational dialects.
    pub fn is_sql(self) -> bool {
        matches!(
            self,
            Self::SqlServer | Self::MySql | Self::Postgres | Self::Hana | Self::Oracle | Self::Sqlite
        )
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a known backend tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBackend(pub String);

impl fmt::Display for UnknownBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown backend type: {}", self.0)
    }
}

impl std::error::Error for UnknownBackend {}

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "http" => Self::Http,
            "soap" => Self::Soap,
            "sqlserver" | "mssql" => Self::SqlServer,
            "mysql" | "mariadb" => Self::MySql,
            "postgres" | "postgresql" => Self::Postgres,
            "hana" => Self::Hana,
            "oracle" => Self::Oracle,
            "sqlite" => Self::Sqlite,
            "store" | "document-store" | "mongodb" => Self::Store,
            "ldap" | "directory" => Self::Ldap,
            "redis" | "cache" => Self::Redis,
            "smtp" | "mail" => Self::Smtp,
            "docker" | "container" => Self::Docker,
            "job" => Self::Job,
            "key" | "key-management" => Self::Key,
            "push" => Self::Push,
            _ => return Err(UnknownBackend(s.to_string())),
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip_through_from_str() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn aliases_parse() {
        assert_eq!("directory".parse::<BackendKind>().unwrap(), BackendKind::Ldap);
        assert_eq!("Cache".parse::<BackendKind>().unwrap(), BackendKind::Redis);
        assert_eq!(
            "key-management".parse::<BackendKind>().unwrap(),
            BackendKind::Key
        );
        assert!("cassandra".parse::<BackendKind>().is_err());
    }

    #[test]
    fn serde_accepts_aliases() {
        let kind: BackendKind = serde_json::from_str("\"document-store\"").unwrap();
        assert_eq!(kind, BackendKind::Store);
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"store\"");
    }

    #[test]
    fn sql_dialects() {
        let sql: Vec<_> = BackendKind::ALL.iter().filter(|k| k.is_sql()).collect();
        assert_eq!(sql.len(), 6);
        assert!(!BackendKind::Store.is_sql());
    }
}
