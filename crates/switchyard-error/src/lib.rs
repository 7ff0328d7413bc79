//! Typed error for individual backend calls.
//!
//! Provides [`CallError`], the failure type every backend driver returns and
//! the value that surfaces to pipeline script as a per-call error placeholder.

use thiserror::Error;

/// Failure of one backend call.
///
/// A `CallError` never aborts sibling calls in the same fan-out step. It is
/// converted into a JSON placeholder with [`CallError::to_placeholder`] and
/// handed back to script at the call's position.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CallError {
    /// No driver is registered for the backend tag.
    #[error("no driver registered for backend: {0}")]
    BackendNotRegistered(String),

    /// The descriptor built by script failed validation before dispatch.
    #[error("invalid {backend} request: {reason}")]
    InvalidDescriptor {
        /// Backend tag of the descriptor.
        backend: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The call exceeded its backend-specific timeout.
    #[error("timeout after {timeout_ms}ms calling backend '{backend}'")]
    Timeout {
        /// Backend tag.
        backend: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The backend itself reported a failure.
    #[error("{backend} error: {message}")]
    Upstream {
        /// Backend tag.
        backend: String,
        /// Message from the backend or driver.
        message: String,
    },

    /// The call named a remote endpoint that has no connection data.
    #[error("remote endpoint not configured: {remote_endpoint}")]
    NotConfigured {
        /// The remote endpoint name.
        remote_endpoint: String,
    },

    /// Catch-all for unexpected failures.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CallError {
    /// Build an [`CallError::InvalidDescriptor`].
    pub fn invalid(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Build an [`CallError::Upstream`].
    pub fn upstream(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BackendNotRegistered(_) => "BACKEND_NOT_REGISTERED",
            Self::InvalidDescriptor { .. } => "INVALID_REQUEST",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::NotConfigured { .. } => "NOT_CONFIGURED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether script could reasonably retry the same call.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Upstream { .. } => true,
            Self::BackendNotRegistered(_) => false,
            Self::InvalidDescriptor { .. } => false,
            Self::NotConfigured { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to the placeholder object script sees in place of a response.
    ///
    /// The object has `error` (the message), `code` and `retryable`, plus
    /// `suggested_fix` when one is available. `known_backends` feeds the
    /// fuzzy match for [`CallError::BackendNotRegistered`].
    pub fn to_placeholder(&self, known_backends: Option<&[&str]>) -> serde_json::Value {
        let suggested_fix = match self {
            Self::BackendNotRegistered(tag) => {
                known_backends.and_then(|known| find_similar_backend(tag, known))
            }
            Self::Timeout { .. } => Some("Retry the call or raise the backend timeout".into()),
            Self::NotConfigured { remote_endpoint } => Some(format!(
                "Add connection data for '{remote_endpoint}' in this environment"
            )),
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
            "retryable": self.retryable(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Find the closest registered backend tag using Levenshtein distance.
fn find_similar_backend(tag: &str, known: &[&str]) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for &candidate in known {
        let dist = strsim::levenshtein(tag, candidate);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }
    best.map(|(_, name)| format!("Did you mean backend '{name}'?"))
}

// Compile-time assertion: CallError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<CallError>();
};
