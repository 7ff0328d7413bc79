//! Audit logging for pipeline executions.
//!
//! Every executed pipeline emits an [`AuditEntry`] containing:
//! - Run id (UUID) and the request's correlation id
//! - SHA-256 hash of the request body (never the raw body)
//! - The component trace and per-call backend/duration/outcome
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::components::ComponentTrace;
use crate::ops::CallRecord;
use crate::SandboxError;

/// A complete audit record for a single pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Identifier of this pipeline run.
    pub run_id: String,
    /// Request correlation id.
    pub request_id: String,
    /// ISO-8601 timestamp of when execution started.
    pub timestamp: DateTime<Utc>,
    /// Proxy endpoint id.
    pub endpoint_id: String,
    /// Proxy endpoint name.
    pub endpoint_name: String,
    /// Definition version that ran.
    pub endpoint_version: u64,
    /// SHA-256 hash of the request body.
    pub request_hash: String,
    /// Per-component trace, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentTrace>,
    /// Backend calls made during execution.
    pub calls: Vec<CallRecord>,
    /// Total execution duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the final response in bytes.
    pub response_size_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The outcome of a pipeline execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// Pipeline completed and produced a response.
    Success,
    /// Execution failed with an error.
    Error {
        /// The error message.
        message: String,
    },
    /// Execution was terminated at the request deadline.
    Timeout,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &str) -> String {
    format!("{:x}", Sha256::digest(data.as_bytes()))
}

/// Builder for constructing audit entries during execution.
pub struct AuditEntryBuilder {
    run_id: String,
    request_id: String,
    timestamp: DateTime<Utc>,
    endpoint_id: String,
    endpoint_name: String,
    endpoint_version: u64,
    request_hash: String,
    components: Vec<ComponentTrace>,
    calls: Vec<CallRecord>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for one request.
    pub fn new(
        request_id: &str,
        pipeline: &switchyard_model::Pipeline,
        request_body: &str,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            endpoint_id: pipeline.endpoint_id.clone(),
            endpoint_name: pipeline.name.clone(),
            endpoint_version: pipeline.version,
            request_hash: sha256_hex(request_body),
            components: Vec::new(),
            calls: Vec::new(),
            start: Instant::now(),
        }
    }

    /// Record the component trace.
    pub fn record_components(&mut self, trace: Vec<ComponentTrace>) {
        self.components = trace;
    }

    /// Record the backend calls.
    pub fn record_calls(&mut self, calls: Vec<CallRecord>) {
        self.calls = calls;
    }

    /// Finalize the audit entry with the final response or error.
    pub fn finish(self, result: Result<&serde_json::Value, &SandboxError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (response_size_bytes, outcome) = match result {
            Ok(value) => {
                let size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
                (size, AuditOutcome::Success)
            }
            Err(SandboxError::Timeout { .. }) => (0, AuditOutcome::Timeout),
            Err(e) => (
                0,
                AuditOutcome::Error {
                    message: crate::redact::redact_error_message(&e.to_string()),
                },
            ),
        };

        AuditEntry {
            run_id: self.run_id,
            request_id: self.request_id,
            timestamp: self.timestamp,
            endpoint_id: self.endpoint_id,
            endpoint_name: self.endpoint_name,
            endpoint_version: self.endpoint_version,
            request_hash: self.request_hash,
            components: self.components,
            calls: self.calls,
            duration_ms,
            response_size_bytes,
            outcome,
        }
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via the [`tracing`] framework.
///
/// Audit entries are logged at `INFO` level with `audit = true` for easy
/// filtering. Components and calls are summarised as counts.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Success => "success",
            AuditOutcome::Error { .. } => "error",
            AuditOutcome::Timeout => "timeout",
        };
        let failed_calls = entry.calls.iter().filter(|c| !c.ok).count();
        tracing::info!(
            audit = true,
            run_id = %entry.run_id,
            request_id = %entry.request_id,
            endpoint = %entry.endpoint_name,
            version = entry.endpoint_version,
            request_hash = %entry.request_hash,
            duration_ms = entry.duration_ms,
            response_size_bytes = entry.response_size_bytes,
            components = entry.components.len(),
            calls = entry.calls.len(),
            failed_calls,
            outcome = outcome,
            "audit"
        );
    }
}
