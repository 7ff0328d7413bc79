//! Driver registry keyed by backend kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use switchyard_model::BackendKind;

use crate::drivers::{
    DockerDriver, HttpDriver, JobDriver, KeyDriver, LdapDriver, MySqlConnector, PoolSettings,
    PostgresConnector, PushDriver, PushProvider, RedisDriver, SmtpDriver, SoapDriver,
    SqlConnector, SqlDriver, SqlServerConnector, StoreDriver,
};
use crate::{Driver, TimeoutDriver};

/// Options for building the default driver set.
#[derive(Clone)]
pub struct DriverOptions {
    /// Timeout for backends without their own entry in `timeouts`.
    pub default_timeout: Duration,
    /// Per-backend timeouts.
    pub timeouts: HashMap<BackendKind, Duration>,
    /// CLI used by the container driver.
    pub docker_binary: String,
    /// Push delivery provider.
    pub push_provider: PushProvider,
    /// Connectors for SQL dialects other than sqlite. Defaults to
    /// PostgreSQL, MySQL and SQL Server.
    pub sql_connectors: HashMap<BackendKind, Arc<dyn SqlConnector>>,
    /// Job driver; kept here so the gateway can bind itself as the runner.
    pub jobs: Arc<JobDriver>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            timeouts: HashMap::new(),
            docker_binary: "docker".to_string(),
            push_provider: PushProvider::Log,
            sql_connectors: Self::sql_connectors(PoolSettings::default()),
            jobs: Arc::new(JobDriver::new()),
        }
    }
}

impl DriverOptions {
    /// The network SQL connectors, pooled with `settings`.
    pub fn sql_connectors(settings: PoolSettings) -> HashMap<BackendKind, Arc<dyn SqlConnector>> {
        let mut connectors: HashMap<BackendKind, Arc<dyn SqlConnector>> = HashMap::new();
        connectors.insert(BackendKind::Postgres, Arc::new(PostgresConnector::new(settings)));
        connectors.insert(BackendKind::MySql, Arc::new(MySqlConnector::new(settings)));
        connectors.insert(BackendKind::SqlServer, Arc::new(SqlServerConnector::new()));
        connectors
    }

    fn timeout_for(&self, kind: BackendKind) -> Duration {
        self.timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

/// Maps each backend kind to the driver that executes it.
pub struct DriverRegistry {
    drivers: HashMap<BackendKind, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Register (or replace) the driver for a backend kind.
    pub fn register(&mut self, kind: BackendKind, driver: Arc<dyn Driver>) {
        self.drivers.insert(kind, driver);
    }

    /// Driver for a backend kind.
    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn Driver>> {
        self.drivers.get(&kind)
    }

    /// Registered backend tags, sorted.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<&'static str> = self.drivers.keys().map(|k| k.as_str()).collect();
        tags.sort_unstable();
        tags
    }

    /// Number of registered drivers.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Whether no driver is registered.
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Every built-in driver, each wrapped in its backend's timeout.
    pub fn with_defaults(options: &DriverOptions) -> anyhow::Result<Self> {
        let mut sql = SqlDriver::new();
        for (dialect, connector) in &options.sql_connectors {
            sql = sql.with_connector(*dialect, connector.clone());
        }
        let sql: Arc<dyn Driver> = Arc::new(sql);

        let mut registry = Self::new();
        let mut add = |kind: BackendKind, driver: Arc<dyn Driver>| {
            let wrapped = TimeoutDriver::new(driver, options.timeout_for(kind));
            registry.register(kind, Arc::new(wrapped));
        };
        add(BackendKind::Http, Arc::new(HttpDriver::new()?));
        add(BackendKind::Soap, Arc::new(SoapDriver::new()?));
        for kind in BackendKind::ALL.into_iter().filter(|k| k.is_sql()) {
            add(kind, sql.clone());
        }
        add(BackendKind::Store, Arc::new(StoreDriver::new()));
        add(BackendKind::Ldap, Arc::new(LdapDriver::new()));
        add(BackendKind::Redis, Arc::new(RedisDriver::new()));
        add(BackendKind::Smtp, Arc::new(SmtpDriver::new()));
        add(
            BackendKind::Docker,
            Arc::new(DockerDriver::new(options.docker_binary.clone())),
        );
        add(BackendKind::Job, options.jobs.clone());
        add(BackendKind::Key, Arc::new(KeyDriver::new()));
        add(
            BackendKind::Push,
            Arc::new(PushDriver::new(options.push_provider.clone())),
        );

        tracing::debug!(drivers = registry.len(), "driver registry built");
        Ok(registry)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
