#![warn(missing_docs)]

//! # switchyard-model
//!
//! Configuration entities and compiled pipeline types for the Switchyard
//! gateway.
//!
//! The [`Catalog`] is what the configuration service publishes: APIs,
//! environments, remote endpoints, shared components and proxy endpoint
//! definitions. The [`pipeline`] module holds the immutable form a proxy
//! endpoint takes once compiled.

mod backend;
mod catalog;
pub mod pipeline;

pub use backend::{BackendKind, UnknownBackend};
pub use catalog::{
    Api, CallSpec, Catalog, CatalogBuilder, Component, ComponentKind, CorsSettings, Environment,
    Library, ProxyEndpointDefinition, RemoteEndpoint, RouteSpec, SessionSettings,
    SharedComponentDefinition, Transformation,
};
pub use pipeline::{CompiledCall, CompiledComponent, Conditional, Pipeline, Script, Step};
