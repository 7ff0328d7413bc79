//! Engine error types.
//!
//! [`CompilationError`] is raised while turning a proxy endpoint definition
//! into a pipeline and blocks that definition from going live.
//! [`GatewayError`] is what ends a single request; each variant maps to one
//! HTTP status.

use switchyard_sandbox::SandboxError;
use thiserror::Error;

/// Why a proxy endpoint definition could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CompilationError {
    /// A component references a shared component that does not exist.
    #[error("{location}: shared component '{id}' does not exist")]
    DanglingSharedComponent {
        /// Component location.
        location: String,
        /// The missing id.
        id: String,
    },

    /// A guard expression does not parse as a single expression.
    #[error("{location}: malformed conditional: {reason}")]
    MalformedConditional {
        /// Guard location.
        location: String,
        /// Parser message.
        reason: String,
    },

    /// A script body does not parse or violates a script limit.
    #[error("{location}: invalid script: {reason}")]
    InvalidScript {
        /// Script location.
        location: String,
        /// Parser or limit message.
        reason: String,
    },

    /// The definition has no routes.
    #[error("proxy endpoint '{0}' has no routes")]
    NoRoutes(String),

    /// A route template does not compile.
    #[error("route {location}: {reason}")]
    InvalidRoute {
        /// Route location.
        location: String,
        /// What was wrong.
        reason: String,
    },

    /// A call names a remote endpoint missing from the catalog.
    #[error("{location}: unknown remote endpoint '{name}'")]
    UnknownRemoteEndpoint {
        /// Call location.
        location: String,
        /// The remote endpoint name.
        name: String,
    },

    /// A component is structurally incomplete, e.g. a single call without a call.
    #[error("{location}: {reason}")]
    InvalidComponent {
        /// Component location.
        location: String,
        /// What was wrong.
        reason: String,
    },

    /// The definition's environment or API is missing from the catalog.
    #[error("unknown {what} '{name}'")]
    UnknownReference {
        /// `environment` or `api`.
        what: &'static str,
        /// The missing name.
        name: String,
    },
}

/// A request-ending failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No route matches the request.
    #[error("no route matches {method} {path}")]
    RoutingFailure {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// The matched endpoint's pipeline does not compile.
    #[error(transparent)]
    Compilation(#[from] CompilationError),

    /// Pipeline script failed.
    #[error("script error at {location}: {message}")]
    ScriptFault {
        /// Failing script location.
        location: String,
        /// Script error message.
        message: String,
    },

    /// The request deadline passed.
    #[error("request deadline of {timeout_ms}ms exceeded")]
    DeadlineExceeded {
        /// Configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// Too many concurrent sandbox sessions.
    #[error("gateway overloaded: {0}")]
    Overloaded(String),

    /// Anything else: heap exhaustion, oversized responses, internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code for the error.
    pub fn status(&self) -> u16 {
        match self {
            Self::RoutingFailure { .. } => 404,
            Self::Compilation(_) => 500,
            Self::ScriptFault { .. } => 500,
            Self::DeadlineExceeded { .. } => 504,
            Self::Overloaded(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Static error kind, used for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoutingFailure { .. } => "routing",
            Self::Compilation(_) => "compilation",
            Self::ScriptFault { .. } => "script",
            Self::DeadlineExceeded { .. } => "deadline",
            Self::Overloaded(_) => "overloaded",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<SandboxError> for GatewayError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::ScriptFault { location, message } => {
                Self::ScriptFault { location, message }
            }
            SandboxError::Timeout { timeout_ms } => Self::DeadlineExceeded { timeout_ms },
            SandboxError::ConcurrencyLimit { .. } => Self::Overloaded(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
