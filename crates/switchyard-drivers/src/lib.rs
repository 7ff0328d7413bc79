#![warn(missing_docs)]

//! # switchyard-drivers
//!
//! Backend driver registry and the concurrent call dispatcher.
//!
//! Script hands descriptors to the [`CallDispatcher`], which resolves each
//! call's connection data, validates the descriptor into a typed
//! [`BackendRequest`], runs every call of the step as an independent task and
//! returns the results in request order. A failed call becomes an error
//! placeholder in its own slot.
//!
//! Adding a backend means implementing [`Driver`] and registering it for a
//! [`BackendKind`](switchyard_model::BackendKind) in the [`DriverRegistry`].

pub mod descriptor;
pub mod dispatcher;
pub mod drivers;
pub mod registry;
pub mod timeout;

pub use descriptor::BackendRequest;
pub use dispatcher::{CallDispatcher, ConnectionResolver, ResolvedEndpoint};
pub use registry::{DriverOptions, DriverRegistry};
pub use timeout::TimeoutDriver;

use serde_json::Value;
use switchyard_error::CallError;

/// A backend driver.
///
/// Drivers never see script. They receive a validated request and the
/// remote endpoint's connection data, already merged for the environment.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// Execute one request.
    async fn execute(&self, request: BackendRequest, connection: &Value)
        -> Result<Value, CallError>;
}
