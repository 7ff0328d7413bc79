//! Error types for the Switchyard sandbox.

use thiserror::Error;

/// Errors that end a request's sandbox session.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The final response exceeds the configured maximum size.
    #[error("response exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// The request deadline passed (async event loop or CPU-bound watchdog).
    #[error("request deadline of {timeout_ms}ms exceeded")]
    Timeout {
        /// Configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// An unhandled error in pipeline script.
    #[error("script error at {location}: {message}")]
    ScriptFault {
        /// Pipeline location of the failing script, e.g. `component[1].after[0]`.
        location: String,
        /// The error message from the script.
        message: String,
    },

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Too many concurrent sandbox sessions.
    #[error("concurrency limit reached (max {max} concurrent sessions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent sessions.
        max: usize,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,
}

impl SandboxError {
    /// Whether this error is the request deadline being exceeded.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn script(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScriptFault {
            location: location.into(),
            message: message.into(),
        }
    }
}
