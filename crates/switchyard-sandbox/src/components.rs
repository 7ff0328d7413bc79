//! Component executor: walks a compiled pipeline inside a Sandbox Session.
//!
//! Each component moves through
//! `Idle → EvaluatingConditional → Dispatching → AwaitingResults →
//! Transforming → Completed | Failed`. A guard whose truthiness does not
//! match its polarity skips only its own component. A snippet that returns
//! `stop` ends the pipeline after that snippet.

use std::time::Instant;

use serde::Serialize;
use switchyard_model::{CompiledCall, CompiledComponent, Conditional, Pipeline, Script, Step};

use crate::error::SandboxError;
use crate::executor::SandboxSession;

/// Component execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    /// Not started.
    Idle,
    /// Evaluating the component guard.
    EvaluatingConditional,
    /// Running `before` transformations and collecting call descriptors.
    Dispatching,
    /// Waiting on the joined results of the fan-out step.
    AwaitingResults,
    /// Running `after` transformations (or a `js` step body).
    Transforming,
    /// Finished without error.
    Completed,
    /// Ended by an unhandled script error or the deadline.
    Failed,
}

/// How a component ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentOutcome {
    /// The guard did not match its polarity.
    Skipped,
    /// All steps ran.
    Completed,
    /// A snippet returned `stop`; later components do not run.
    Stopped,
}

/// Execution record of one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentTrace {
    /// Component label, e.g. `component[2]`.
    pub label: String,
    /// States visited, in order.
    pub states: Vec<ComponentState>,
    /// How the component ended.
    pub outcome: ComponentOutcome,
    /// Backend calls dispatched.
    pub calls: usize,
    /// Wall time spent in the component.
    pub duration_ms: u64,
}

struct Tracker {
    label: String,
    states: Vec<ComponentState>,
    start: Instant,
    calls: usize,
}

impl Tracker {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            states: vec![ComponentState::Idle],
            start: Instant::now(),
            calls: 0,
        }
    }

    fn enter(&mut self, state: ComponentState) {
        if self.states.last() != Some(&state) {
            tracing::trace!(component = %self.label, state = ?state, "component state");
            self.states.push(state);
        }
    }

    fn finish(mut self, outcome: ComponentOutcome) -> ComponentTrace {
        if outcome != ComponentOutcome::Skipped {
            self.enter(ComponentState::Completed);
        }
        ComponentTrace {
            label: self.label,
            states: self.states,
            outcome,
            calls: self.calls,
            duration_ms: self.start.elapsed().as_millis() as u64,
        }
    }
}

/// Runs a pipeline's components in declared order.
pub(crate) struct ComponentExecutor<'a> {
    session: &'a mut SandboxSession,
}

impl<'a> ComponentExecutor<'a> {
    pub(crate) fn new(session: &'a mut SandboxSession) -> Self {
        Self { session }
    }

    /// Run every component. Returns the trace of the components that ran,
    /// including skipped ones.
    pub(crate) async fn run(
        &mut self,
        pipeline: &Pipeline,
    ) -> Result<Vec<ComponentTrace>, SandboxError> {
        let mut traces = Vec::with_capacity(pipeline.components.len());
        for component in &pipeline.components {
            let mut tracker = Tracker::new(&component.label);
            let outcome = match self.run_component(component, &mut tracker).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracker.enter(ComponentState::Failed);
                    tracing::debug!(
                        component = %component.label,
                        states = ?tracker.states,
                        error = %e,
                        "component failed"
                    );
                    return Err(e);
                }
            };
            let trace = tracker.finish(outcome);
            tracing::debug!(
                component = %trace.label,
                outcome = ?trace.outcome,
                calls = trace.calls,
                duration_ms = trace.duration_ms,
                "component finished"
            );
            traces.push(trace);
            if outcome == ComponentOutcome::Stopped {
                break;
            }
        }
        Ok(traces)
    }

    async fn run_component(
        &mut self,
        component: &CompiledComponent,
        tracker: &mut Tracker,
    ) -> Result<ComponentOutcome, SandboxError> {
        if let Some(guard) = &component.conditional {
            tracker.enter(ComponentState::EvaluatingConditional);
            let label = format!("{}.conditional", component.label);
            if !self.guard_passes(&label, guard).await? {
                return Ok(ComponentOutcome::Skipped);
            }
        }

        match &component.step {
            Step::Script(script) => {
                tracker.enter(ComponentState::Transforming);
                if self.run_scripts(&component.before).await? {
                    return Ok(ComponentOutcome::Stopped);
                }
                if self.run_scripts(std::slice::from_ref(script)).await? {
                    return Ok(ComponentOutcome::Stopped);
                }
            }
            Step::Calls(calls) => {
                tracker.enter(ComponentState::Dispatching);
                let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                let prepare = format!("__sy.prepareCalls({});", serde_json::to_string(&names)?);
                self.session
                    .run_snippet(&component.label, &prepare, false)
                    .await?;

                if self.run_scripts(&component.before).await? {
                    return Ok(ComponentOutcome::Stopped);
                }

                let mut active: Vec<&CompiledCall> = Vec::with_capacity(calls.len());
                for (i, call) in calls.iter().enumerate() {
                    if let Some(guard) = &call.conditional {
                        let label = format!("{}.calls[{i}].conditional", component.label);
                        if !self.guard_passes(&label, guard).await? {
                            tracing::debug!(call = %call.name, "call skipped by conditional");
                            continue;
                        }
                    }
                    active.push(call);
                }

                for call in &active {
                    if self.run_scripts(&call.before).await? {
                        return Ok(ComponentOutcome::Stopped);
                    }
                }

                if !active.is_empty() {
                    tracker.enter(ComponentState::AwaitingResults);
                    let specs: Vec<serde_json::Value> = active
                        .iter()
                        .map(|c| serde_json::json!({ "name": c.name, "endpoint": c.remote_endpoint }))
                        .collect();
                    let dispatch =
                        format!("await __sy.dispatch({});", serde_json::to_string(&specs)?);
                    self.session
                        .run_snippet(&component.label, &dispatch, false)
                        .await?;
                    tracker.calls += active.len();
                }

                tracker.enter(ComponentState::Transforming);
                for call in &active {
                    if self.run_scripts(&call.after).await? {
                        return Ok(ComponentOutcome::Stopped);
                    }
                }
            }
        }

        tracker.enter(ComponentState::Transforming);
        if self.run_scripts(&component.after).await? {
            return Ok(ComponentOutcome::Stopped);
        }
        Ok(ComponentOutcome::Completed)
    }

    async fn guard_passes(
        &mut self,
        label: &str,
        guard: &Conditional,
    ) -> Result<bool, SandboxError> {
        let body = format!(
            "return !!(\n{}\n);",
            crate::syntax::normalize_conditional(&guard.expression)
        );
        let result = self.session.run_snippet(label, &body, true).await?;
        let truthy = result.value.as_bool().unwrap_or(false);
        Ok(truthy == guard.positive)
    }

    /// Run scripts in order. Returns `true` when one of them returned `stop`.
    async fn run_scripts(&mut self, scripts: &[Script]) -> Result<bool, SandboxError> {
        for script in scripts {
            let result = self
                .session
                .run_snippet(&script.label, &script.source, false)
                .await?;
            if result.stop {
                tracing::debug!(location = %script.label, "pipeline stopped by script");
                return Ok(true);
            }
        }
        Ok(false)
    }
}
