//! Compiled, immutable pipeline representation.
//!
//! Produced by the pipeline loader from a [`ProxyEndpointDefinition`] with
//! every shared-component reference resolved and every script checked. A
//! `Pipeline` is shared behind an `Arc` by all requests for its version.
//!
//! [`ProxyEndpointDefinition`]: crate::ProxyEndpointDefinition

use crate::BackendKind;

/// A script fragment with a label used in error locations and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Location label, e.g. `component[1].before[0]`.
    pub label: String,
    /// Script source.
    pub source: String,
}

impl Script {
    /// Create a labelled script.
    pub fn new(label: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            source: source.into(),
        }
    }
}

/// A guard expression with its polarity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conditional {
    /// Expression source.
    pub expression: String,
    /// The step runs when the expression's truthiness equals this.
    pub positive: bool,
}

/// A compiled backend call.
#[derive(Debug, Clone)]
pub struct CompiledCall {
    /// Script variable bound to the call object.
    pub name: String,
    /// Remote endpoint name.
    pub remote_endpoint: String,
    /// Backend type of the remote endpoint.
    pub backend: BackendKind,
    /// Per-call guard.
    pub conditional: Option<Conditional>,
    /// Runs before the request is collected.
    pub before: Vec<Script>,
    /// Runs after the response is stored.
    pub after: Vec<Script>,
}

/// What a component does once its guard passes.
#[derive(Debug, Clone)]
pub enum Step {
    /// Dispatch these calls as one fan-out step.
    Calls(Vec<CompiledCall>),
    /// Run a script body.
    Script(Script),
}

/// A compiled pipeline step.
#[derive(Debug, Clone)]
pub struct CompiledComponent {
    /// Location label, e.g. `component[0]`.
    pub label: String,
    /// Guard, if any.
    pub conditional: Option<Conditional>,
    /// Transformations before the step.
    pub before: Vec<Script>,
    /// The step itself.
    pub step: Step,
    /// Transformations after the step.
    pub after: Vec<Script>,
}

impl CompiledComponent {
    /// Number of backend calls this component may dispatch.
    pub fn call_count(&self) -> usize {
        match &self.step {
            Step::Calls(calls) => calls.len(),
            Step::Script(_) => 0,
        }
    }
}

/// An executable pipeline for one proxy endpoint version.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Proxy endpoint id.
    pub endpoint_id: String,
    /// Proxy endpoint name.
    pub name: String,
    /// Definition version this was compiled from.
    pub version: u64,
    /// Owning API.
    pub api: String,
    /// Environment the pipeline runs in.
    pub environment: String,
    /// API libraries evaluated before the components.
    pub libraries: Vec<Script>,
    /// Steps in declared order.
    pub components: Vec<CompiledComponent>,
}
