#![warn(missing_docs)]

//! # switchyard-sandbox
//!
//! Per-request script sandbox for the Switchyard gateway.
//!
//! Every inbound request gets a fresh deno_core isolate (a Sandbox Session)
//! with a frozen, request-scoped `AP` capability namespace. The
//! [`components`] executor walks a compiled pipeline inside that session:
//! guards, transformations and backend calls. Script never reaches a
//! backend directly; it builds descriptors that go through a
//! [`RequestDispatcher`] on the host side.
//!
//! ## Isolation
//!
//! - **Fresh runtime per request**: no script state survives the request
//! - **No ambient capabilities**: no fs, net, env, `Deno` or `eval`
//! - **Deadline**: a watchdog terminates the isolate when the request
//!   deadline passes, including CPU-bound loops
//! - **Heap limit**: V8 heap is capped and exhaustion ends the request
//! - **Shared state only through the host**: the [`SessionStore`] and the
//!   [`EnvironmentAccessor`] are the only cross-request state script sees

pub mod audit;
mod bootstrap;
pub mod components;
pub mod error;
pub mod executor;
pub mod ops;
pub mod redact;
pub mod session;
pub mod syntax;
pub mod validator;

pub use components::{ComponentOutcome, ComponentState, ComponentTrace};
pub use error::SandboxError;
pub use executor::{Invocation, PipelineOutcome, SandboxConfig, SandboxExecutor};
pub use session::{CookieOptions, SessionHandle, SessionStore, SessionStoreConfig};
pub use syntax::{
    check_conditional, check_script, check_size, normalize_conditional, ScriptCheckError,
};

use serde_json::Value;
use switchyard_error::CallError;

/// One backend call handed from script to the host.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    /// Remote endpoint supplying connection data, if the call names one.
    pub remote_endpoint: Option<String>,
    /// The descriptor as built by script.
    pub request: Value,
}

/// Trait for dispatching backend calls produced inside the sandbox.
///
/// Implementations own the drivers and connection data. The sandbox never
/// sees either; it only hands over descriptors and receives results.
#[async_trait::async_trait]
pub trait RequestDispatcher: Send + Sync {
    /// Execute all calls of one pipeline step.
    ///
    /// The returned vector has the same length and order as `calls`,
    /// whatever order the calls complete in. A failed call occupies its own
    /// slot and never affects its siblings.
    async fn dispatch(&self, calls: Vec<OutboundCall>) -> Vec<Result<Value, CallError>>;

    /// Backend tags this dispatcher can serve, for error suggestions.
    fn known_backends(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Result of resolving a name against an environment.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The name is configured.
    Value(Value),
    /// The name is not configured in this environment.
    NotConfigured,
}

/// Read access to the current request's environment.
pub trait EnvironmentAccessor: Send + Sync {
    /// Environment name.
    fn name(&self) -> &str;

    /// Resolve a configuration value by name.
    fn resolve(&self, name: &str) -> Resolution;
}
