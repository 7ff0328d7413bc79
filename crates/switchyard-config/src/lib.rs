#![warn(missing_docs)]

//! # switchyard-config
//!
//! Configuration loading for the Switchyard gateway.
//!
//! Two files drive a running gateway: `switchyard.toml`, the process
//! configuration parsed into [`GatewayConfig`], and the catalog file holding
//! APIs, environments, remote endpoints and proxy endpoint definitions,
//! loaded with [`load_catalog`]. Both support `${ENV_VAR}` expansion.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:5000"
//! catalog = "catalog.toml"
//! request_id_header = "x-request-id"
//!
//! [sandbox]
//! deadline_ms = 30000
//! max_heap_mb = 64
//!
//! [backends.http]
//! timeout_ms = 5000
//!
//! [backends.docker]
//! binary = "podman"
//! ```

mod catalog;
#[cfg(feature = "config-watch")]
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use switchyard_model::BackendKind;
use thiserror::Error;

pub use catalog::{load_catalog, parse_catalog, CatalogFormat};

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to parse JSON.
    #[error("failed to parse catalog: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Listener and catalog location.
    #[serde(default)]
    pub server: ServerSection,

    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Session store limits.
    #[serde(default)]
    pub sessions: SessionOverrides,

    /// Per-backend settings, keyed by backend tag.
    #[serde(default)]
    pub backends: HashMap<String, BackendSection>,
}

/// The `[server]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Socket address to listen on.
    pub listen: String,
    /// Catalog file path. Relative paths resolve against the config file.
    pub catalog: Option<PathBuf>,
    /// Header whose inbound value is used as the request correlation id.
    pub request_id_header: Option<String>,
    /// Path serving metrics when the `metrics` feature is enabled.
    pub metrics_path: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5000".into(),
            catalog: None,
            request_id_header: None,
            metrics_path: "/metrics".into(),
        }
    }
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Overall per-request deadline in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent sandbox sessions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum backend calls per request.
    #[serde(default)]
    pub max_calls_per_request: Option<usize>,

    /// Maximum size of one script or conditional in bytes.
    #[serde(default)]
    pub max_script_bytes: Option<usize>,

    /// Maximum size of the final response in bytes.
    #[serde(default)]
    pub max_response_bytes: Option<usize>,
}

/// Session store overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionOverrides {
    /// Maximum keys per session.
    #[serde(default)]
    pub max_keys_per_session: Option<usize>,

    /// Maximum serialized size of one value in bytes.
    #[serde(default)]
    pub max_value_bytes: Option<usize>,

    /// Sessions untouched for this long are evicted.
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
}

/// Settings for one backend type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendSection {
    /// Per-call timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Container CLI binary (docker backend).
    #[serde(default)]
    pub binary: Option<String>,

    /// Delivery provider: "webhook" or "log" (push backend).
    #[serde(default)]
    pub provider: Option<String>,

    /// Webhook URL for the webhook push provider.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Pool size per distinct database (postgres and mysql backends).
    #[serde(default)]
    pub max_connections: Option<u32>,
}

impl GatewayConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    ///
    /// A relative `server.catalog` path is resolved against the directory
    /// holding the config file.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_with_env(&content)?;
        if let (Some(catalog), Some(dir)) = (&config.server.catalog, path.parent()) {
            if catalog.is_relative() {
                config.server.catalog = Some(dir.join(catalog));
            }
        }
        Ok(config)
    }

    /// Settings for a backend tag, if configured.
    pub fn backend(&self, kind: BackendKind) -> Option<&BackendSection> {
        self.backends
            .iter()
            .find(|(tag, _)| tag.parse::<BackendKind>().ok() == Some(kind))
            .map(|(_, section)| section)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("server.listen must not be empty".into()));
        }
        if self.sandbox.deadline_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.deadline_ms must be greater than zero".into(),
            ));
        }
        if self.sandbox.max_concurrent == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_concurrent must be greater than zero".into(),
            ));
        }
        for (tag, section) in &self.backends {
            if tag.parse::<BackendKind>().is_err() {
                let known: Vec<&str> = BackendKind::ALL.iter().map(|k| k.as_str()).collect();
                return Err(ConfigError::Invalid(format!(
                    "unknown backend '{}', supported: {}",
                    tag,
                    known.join(", ")
                )));
            }
            if section.timeout_ms == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "backend '{tag}': timeout_ms must be greater than zero"
                )));
            }
            if section.max_connections == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "backend '{tag}': max_connections must be greater than zero"
                )));
            }
            if let Some(provider) = section.provider.as_deref() {
                match provider {
                    "log" => {}
                    "webhook" => {
                        if section.webhook_url.is_none() {
                            return Err(ConfigError::Invalid(format!(
                                "backend '{tag}': webhook provider requires 'webhook_url'"
                            )));
                        }
                    }
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "backend '{tag}': unsupported provider '{other}', supported: log, webhook"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
pub(crate) fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
