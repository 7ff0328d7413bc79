#![warn(missing_docs)]

//! # switchyard-engine
//!
//! The proxy-endpoint execution engine of the Switchyard gateway.
//!
//! - [`routing`] selects a proxy endpoint from method, host, path, scheme,
//!   header and query predicates
//! - [`loader`] compiles definitions into immutable pipelines, cached by
//!   `(id, version)`
//! - [`environment`] resolves environment values and per-endpoint
//!   connection data
//! - [`gateway`] ties them to the sandbox and the drivers: it matches a
//!   request, binds its session cookie, runs the pipeline in a fresh Sandbox
//!   Session and turns the final `response` object into a wire reply
//! - [`server`] puts the gateway behind axum
//!
//! Catalog changes arrive as whole new catalogs. [`Gateway::load_catalog`]
//! compiles every active endpoint and swaps the route table in atomically;
//! an endpoint that fails to compile is deactivated, never half-loaded.

pub mod cookie;
pub mod cors;
pub mod environment;
pub mod error;
pub mod gateway;
pub mod loader;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod request;
pub mod routing;
pub mod server;

pub use environment::{EnvironmentResolver, ScopedEnvironment};
pub use error::{CompilationError, GatewayError};
pub use gateway::{Gateway, ReloadReport, Snapshot};
pub use loader::{CompiledEndpoint, PipelineLoader};
#[cfg(feature = "metrics")]
pub use metrics::GatewayMetrics;
pub use request::{InboundRequest, WireResponse};
pub use routing::{Route, RouteMatch, RouteRequest, RouteTable};
pub use server::GatewayServer;
