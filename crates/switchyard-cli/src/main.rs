#![warn(missing_docs)]

//! Switchyard API gateway
//!
//! Serves proxy endpoints from a catalog file, reloading it when it changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use switchyard_config::watcher::ConfigWatcher;
use switchyard_config::{GatewayConfig, SandboxOverrides, SessionOverrides};
use switchyard_drivers::drivers::{
    MySqlConnector, PoolSettings, PostgresConnector, PushProvider, SqlServerConnector,
};
use switchyard_drivers::{DriverOptions, DriverRegistry};
use switchyard_engine::{Gateway, GatewayMetrics, GatewayServer, PipelineLoader};
use switchyard_model::{BackendKind, Catalog};
use switchyard_sandbox::audit::TracingAuditLogger;
use switchyard_sandbox::{SandboxConfig, SandboxExecutor, SessionStore, SessionStoreConfig};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(ms) = overrides.deadline_ms {
        config.deadline = Duration::from_millis(ms);
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(calls) = overrides.max_calls_per_request {
        config.max_calls_per_request = calls;
    }
    if let Some(bytes) = overrides.max_response_bytes {
        config.max_response_size = bytes;
    }
    config
}

/// Build SessionStoreConfig from config overrides.
fn build_session_config(overrides: &SessionOverrides) -> SessionStoreConfig {
    let mut config = SessionStoreConfig::default();
    if let Some(keys) = overrides.max_keys_per_session {
        config.max_keys_per_session = keys;
    }
    if let Some(bytes) = overrides.max_value_bytes {
        config.max_value_size = bytes;
    }
    if let Some(secs) = overrides.idle_ttl_secs {
        config.idle_ttl = Duration::from_secs(secs);
    }
    config
}

/// Build DriverOptions from the `[backends.*]` sections.
fn build_driver_options(config: &GatewayConfig) -> Result<DriverOptions> {
    let mut options = DriverOptions::default();
    for kind in BackendKind::ALL {
        let Some(section) = config.backend(kind) else {
            continue;
        };
        if let Some(ms) = section.timeout_ms {
            options.timeouts.insert(kind, Duration::from_millis(ms));
        }
    }
    let pool = |kind: BackendKind| {
        let mut settings = PoolSettings::default();
        if let Some(max) = config.backend(kind).and_then(|s| s.max_connections) {
            settings.max_connections = max;
        }
        settings
    };
    options.sql_connectors.insert(
        BackendKind::Postgres,
        Arc::new(PostgresConnector::new(pool(BackendKind::Postgres))),
    );
    options.sql_connectors.insert(
        BackendKind::MySql,
        Arc::new(MySqlConnector::new(pool(BackendKind::MySql))),
    );
    options
        .sql_connectors
        .insert(BackendKind::SqlServer, Arc::new(SqlServerConnector::new()));
    if let Some(binary) = config
        .backend(BackendKind::Docker)
        .and_then(|s| s.binary.clone())
    {
        options.docker_binary = binary;
    }
    if let Some(push) = config.backend(BackendKind::Push) {
        if push.provider.as_deref() == Some("webhook") {
            let url = push
                .webhook_url
                .clone()
                .context("backends.push.webhook_url is required for the webhook provider")?;
            options.push_provider = PushProvider::Webhook(url);
        }
    }
    Ok(options)
}

/// Locate the config file.
///
/// Search order:
/// 1. `SWITCHYARD_CONFIG` environment variable
/// 2. `./switchyard.toml` in the current directory
/// 3. None (defaults apply)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("SWITCHYARD_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("switchyard.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("switchyard {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            GatewayConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => {
            tracing::info!("no config file found, using defaults");
            GatewayConfig::from_toml("")?
        }
    };

    let executor = Arc::new(SandboxExecutor::with_audit_logger(
        build_sandbox_config(&config.sandbox),
        Arc::new(TracingAuditLogger),
    ));
    let options = build_driver_options(&config)?;
    let drivers = Arc::new(
        DriverRegistry::with_defaults(&options).context("failed to initialise backend drivers")?,
    );
    let sessions = Arc::new(SessionStore::new(build_session_config(&config.sessions)));

    let mut registry = Registry::default();
    let metrics = Arc::new(GatewayMetrics::new(&mut registry));

    let mut gateway = Gateway::new(executor, drivers, sessions).with_metrics(metrics);
    if let Some(bytes) = config.sandbox.max_script_bytes {
        gateway = gateway.with_loader(PipelineLoader::new(bytes));
    }
    if let Some(header) = &config.server.request_id_header {
        gateway = gateway.with_request_id_header(header.clone());
    }
    let gateway = Arc::new(gateway);
    gateway.bind_jobs(&options.jobs);

    let catalog_path = config.server.catalog.clone();
    let watcher_handles = match &catalog_path {
        Some(path) => {
            let watcher = ConfigWatcher::<Catalog>::new(path)
                .with_context(|| format!("failed to load catalog from {}", path.display()))?;
            let report = gateway.load_catalog(watcher.current());
            if !report.inactive.is_empty() {
                tracing::warn!(
                    inactive = report.inactive.len(),
                    "some proxy endpoints failed to compile"
                );
            }
            let follower = gateway.follow(watcher.subscribe());
            Some((watcher.start(), follower))
        }
        None => {
            tracing::warn!("no catalog configured, every request will be answered with 404");
            None
        }
    };

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    let server = GatewayServer::new(gateway.clone())
        .with_metrics(config.server.metrics_path.clone(), Arc::new(registry));
    let serving = tokio::spawn(server.serve(listener, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal, stopping gracefully");
    }));

    #[cfg(unix)]
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    tokio::pin!(serving);

    loop {
        let sighup_fut = async {
            #[cfg(unix)]
            {
                sighup.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            result = &mut serving => {
                result.context("server task failed")??;
                break;
            }
            _ = sighup_fut => {
                match &catalog_path {
                    Some(path) => {
                        tracing::info!("received SIGHUP, reloading catalog");
                        match switchyard_config::load_catalog(path) {
                            Ok(catalog) => {
                                gateway.load_catalog(Arc::new(catalog));
                            }
                            Err(e) => tracing::error!(error = %e, "catalog reload failed, keeping current catalog"),
                        }
                    }
                    None => tracing::info!("received SIGHUP, no catalog configured"),
                }
            }
        }
    }

    if let Some((watcher, follower)) = watcher_handles {
        watcher.abort();
        follower.abort();
    }

    Ok(())
}
