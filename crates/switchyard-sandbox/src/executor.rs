//! Sandbox executor: one fresh V8 isolate per inbound request.
//!
//! No script state survives a request. V8 isolates are `!Send`, so each
//! Sandbox Session lives on a dedicated thread with its own single-threaded
//! tokio runtime; the public API is async and `Send`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use serde_json::Value;
use switchyard_model::Pipeline;
use tokio::sync::Semaphore;

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::bootstrap::BOOTSTRAP;
use crate::components::{ComponentExecutor, ComponentTrace};
use crate::error::SandboxError;
use crate::ops::{
    switchyard_ext, CallLimits, CallRecord, CallRecords, ExecutionResult, IncomingRequest,
    RequestContext,
};
use crate::session::SessionHandle;
use crate::{EnvironmentAccessor, RequestDispatcher};

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Overall request deadline, covering every script and backend call.
    pub deadline: Duration,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent Sandbox Sessions.
    pub max_concurrent: usize,
    /// Maximum backend calls per request.
    pub max_calls_per_request: usize,
    /// Maximum size of the serialized final response in bytes.
    pub max_response_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_concurrent: 64,
            max_calls_per_request: 64,
            max_response_size: 8 * 1024 * 1024, // 8 MB
        }
    }
}

/// Everything one request brings into its Sandbox Session.
pub struct Invocation {
    /// Per-request correlation id.
    pub request_id: String,
    /// Compiled pipeline to run.
    pub pipeline: Arc<Pipeline>,
    /// The incoming request object exposed to script as `request`.
    pub request: Value,
    /// Host-side backend call dispatcher.
    pub dispatcher: Arc<dyn RequestDispatcher>,
    /// The pipeline's environment.
    pub environment: Arc<dyn EnvironmentAccessor>,
    /// Session bound to the request's cookie.
    pub session: SessionHandle,
}

/// Result of a completed pipeline.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// The final `response` object as set by script.
    pub response: Value,
    /// The session handle, carrying any newly minted id and cookie options.
    pub session: SessionHandle,
    /// Per-component trace.
    pub trace: Vec<ComponentTrace>,
    /// Backend calls made.
    pub calls: Vec<CallRecord>,
}

/// The sandbox executor.
///
/// `Send + Sync`; all V8 work happens on per-request threads. A semaphore
/// caps the number of live isolates.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: Arc::new(NoopAuditLogger),
        }
    }

    /// Create a new sandbox executor with an audit logger.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: logger,
        }
    }

    /// The executor's configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run a compiled pipeline for one request in a fresh Sandbox Session.
    pub async fn execute_pipeline(
        &self,
        invocation: Invocation,
    ) -> Result<PipelineOutcome, SandboxError> {
        let body = invocation
            .request
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut audit = AuditEntryBuilder::new(&invocation.request_id, &invocation.pipeline, &body);

        let _permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        let request_id = invocation.request_id.clone();
        let endpoint = invocation.pipeline.name.clone();
        tracing::debug!(%request_id, %endpoint, "sandbox session starting");

        let config = self.config.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                        tracing::warn!("sandbox result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_pipeline(&config, invocation));
            if tx.send(result).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        });

        let result = rx
            .await
            .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")))
            .and_then(|r| r);

        if let Ok(outcome) = &result {
            audit.record_components(outcome.trace.clone());
            audit.record_calls(outcome.calls.clone());
        }
        let entry = audit.finish(result.as_ref().map(|o| &o.response));
        self.audit_logger.log(&entry).await;

        match &result {
            Ok(outcome) => tracing::debug!(
                %request_id,
                %endpoint,
                components = outcome.trace.len(),
                calls = outcome.calls.len(),
                "sandbox session complete"
            ),
            Err(e) => tracing::warn!(%request_id, %endpoint, error = %e, "sandbox session failed"),
        }

        result
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the session's `Box<HeapLimitState>`, which is
    // dropped only after the runtime that owns the isolate.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Result of one snippet.
#[derive(Debug, Default)]
pub(crate) struct SnippetResult {
    /// The snippet returned the `stop` sentinel.
    pub stop: bool,
    /// The snippet's return value, when captured.
    pub value: Value,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// A live Sandbox Session: the runtime plus its deadline watchdog.
///
/// Field order matters: the runtime drops before the heap state it points at.
pub(crate) struct SandboxSession {
    runtime: JsRuntime,
    heap_state: Box<HeapLimitState>,
    timed_out: Arc<AtomicBool>,
    cancel_tx: Option<std::sync::mpsc::Sender<()>>,
    watchdog: Option<std::thread::JoinHandle<()>>,
    deadline: Instant,
    deadline_ms: u64,
    max_response_size: usize,
}

impl SandboxSession {
    /// Create the runtime, bind the request's capabilities into OpState and
    /// start the deadline watchdog.
    fn start(config: &SandboxConfig, invocation: Invocation) -> Result<Self, SandboxError> {
        let request_json = serde_json::to_string(&invocation.request)?;
        let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![switchyard_ext::init_ops_and_esm()],
            create_params: Some(create_params),
            ..Default::default()
        });

        {
            let op_state = runtime.op_state();
            let mut state = op_state.borrow_mut();
            state.put(invocation.dispatcher);
            state.put(invocation.environment);
            state.put(invocation.session);
            state.put(IncomingRequest(request_json));
            state.put(RequestContext {
                request_id: invocation.request_id,
                endpoint: invocation.pipeline.name.clone(),
            });
            state.put(CallLimits {
                max_calls: config.max_calls_per_request,
                calls_made: 0,
            });
            state.put(CallRecords::default());
        }

        let heap_state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );

        let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog_timed_out = timed_out.clone();
        let deadline = config.deadline;
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
        let watchdog = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) =
                cancel_rx.recv_timeout(deadline)
            {
                watchdog_timed_out.store(true, Ordering::SeqCst);
                watchdog_handle.terminate_execution();
            }
        });

        Ok(Self {
            runtime,
            heap_state,
            timed_out,
            cancel_tx: Some(cancel_tx),
            watchdog: Some(watchdog),
            deadline: Instant::now() + deadline,
            deadline_ms: deadline.as_millis() as u64,
            max_response_size: config.max_response_size,
        })
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn deadline_error(&self) -> SandboxError {
        SandboxError::Timeout {
            timeout_ms: self.deadline_ms,
        }
    }

    /// Map a failure to its cause: heap first, then the deadline, then the
    /// script's own error.
    fn failure(&self, location: &str, message: String) -> SandboxError {
        if self.heap_state.triggered.load(Ordering::SeqCst) {
            return SandboxError::HeapLimitExceeded;
        }
        if self.timed_out.load(Ordering::SeqCst) {
            return self.deadline_error();
        }
        SandboxError::script(location, message)
    }

    /// Evaluate the bootstrap and the API libraries at top level.
    fn bootstrap(&mut self, libraries: &[switchyard_model::Script]) -> Result<(), SandboxError> {
        if let Err(e) = self
            .runtime
            .execute_script("[switchyard:bootstrap]", BOOTSTRAP)
        {
            return Err(match self.failure("bootstrap", e.to_string()) {
                SandboxError::ScriptFault { message, .. } => {
                    SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {message}"))
                }
                other => other,
            });
        }
        for library in libraries {
            if let Err(e) = self
                .runtime
                .execute_script("[switchyard:library]", library.source.clone())
            {
                return Err(self.failure(&library.label, e.to_string()));
            }
        }
        Ok(())
    }

    /// Run a script body as an async function with `this` bound to the
    /// global object, driving the event loop until it settles.
    pub(crate) async fn run_snippet(
        &mut self,
        label: &str,
        body: &str,
        capture: bool,
    ) -> Result<SnippetResult, SandboxError> {
        if self.timed_out.load(Ordering::SeqCst) || self.remaining().is_zero() {
            return Err(self.deadline_error());
        }

        self.runtime
            .op_state()
            .borrow_mut()
            .try_take::<ExecutionResult>();

        let body = match crate::syntax::hoist_declarations(body) {
            Some(hoisted) if !hoisted.names.is_empty() || !hoisted.functions.is_empty() => {
                publish_bindings(&hoisted)
            }
            _ => body.to_string(),
        };
        let wrapped = format!(
            r#"(async function () {{
    try {{
        const __r = await (async function () {{
{body}
        }}).call(globalThis);
        const __stop = __r === __sy.STOP;
        __sy.setResult(JSON.stringify({{
            stop: __stop,
            value: {capture} && !__stop && __r !== undefined ? __r : null
        }}));
    }} catch (e) {{
        __sy.setResult(JSON.stringify({{ error: (e && e.message) || String(e) }}));
    }}
}})();"#
        );

        let exec_error = match self.runtime.execute_script("[switchyard:snippet]", wrapped) {
            Ok(_) => {
                match tokio::time::timeout(
                    self.remaining(),
                    self.runtime
                        .run_event_loop(PollEventLoopOptions::default()),
                )
                .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => {
                        self.timed_out.store(true, Ordering::SeqCst);
                        return Err(self.deadline_error());
                    }
                }
            }
            Err(e) => Some(e.to_string()),
        };

        if let Some(message) = exec_error {
            return Err(self.failure(label, message));
        }
        if self.heap_state.triggered.load(Ordering::SeqCst) {
            return Err(SandboxError::HeapLimitExceeded);
        }

        let result_str = self
            .runtime
            .op_state()
            .borrow_mut()
            .try_take::<ExecutionResult>()
            .map(|r| r.0)
            .ok_or_else(|| SandboxError::script(label, "script did not complete"))?;

        let envelope: Envelope = serde_json::from_str(&result_str)?;
        if let Some(message) = envelope.error {
            return Err(SandboxError::script(label, message));
        }
        Ok(SnippetResult {
            stop: envelope.stop,
            value: envelope.value,
        })
    }

    /// Read the global `response` as the pipeline's final response.
    async fn final_response(&mut self) -> Result<Value, SandboxError> {
        let result = self
            .run_snippet("response", "return __sy.finalResponse();", true)
            .await?;
        let size = serde_json::to_string(&result.value)?.len();
        if size > self.max_response_size {
            return Err(SandboxError::OutputTooLarge {
                max: self.max_response_size,
            });
        }
        Ok(result.value)
    }

    fn take_session(&mut self) -> Result<SessionHandle, SandboxError> {
        self.runtime
            .op_state()
            .borrow_mut()
            .try_take::<SessionHandle>()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("session handle missing")))
    }

    fn take_calls(&mut self) -> Vec<CallRecord> {
        self.runtime
            .op_state()
            .borrow_mut()
            .try_take::<CallRecords>()
            .map(|r| r.0)
            .unwrap_or_default()
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        // The watchdog holds an isolate handle; it must exit before the
        // runtime is dropped.
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }
    }
}

/// Seed the hoisted variables from the global object and write them back
/// when the body finishes, however it exits. Functions are published on
/// entry, where their block binding is already initialised.
fn publish_bindings(hoisted: &crate::syntax::Hoisted) -> String {
    let key = |name: &String| Value::String(name.clone()).to_string();
    let mut out = String::new();
    if hoisted.strict {
        out.push_str("\"use strict\";\n");
    }
    if !hoisted.names.is_empty() {
        let seed: Vec<String> = hoisted
            .names
            .iter()
            .map(|name| format!("{name} = globalThis[{}]", key(name)))
            .collect();
        out.push_str(&format!("var {};\n", seed.join(", ")));
    }
    out.push_str("try {\n");
    for name in &hoisted.functions {
        out.push_str(&format!("globalThis[{}] = {name};\n", key(name)));
    }
    out.push_str(&hoisted.source);
    out.push_str("\n} finally {\n");
    for name in &hoisted.names {
        out.push_str(&format!("globalThis[{}] = {name};\n", key(name)));
    }
    out.push('}');
    out
}

/// Run a pipeline on the current thread (must be a dedicated thread, not the
/// main tokio runtime).
async fn run_pipeline(
    config: &SandboxConfig,
    invocation: Invocation,
) -> Result<PipelineOutcome, SandboxError> {
    let pipeline = invocation.pipeline.clone();
    let mut session = SandboxSession::start(config, invocation)?;
    session.bootstrap(&pipeline.libraries)?;

    let trace = ComponentExecutor::new(&mut session).run(&pipeline).await?;
    let response = session.final_response().await?;

    Ok(PipelineOutcome {
        response,
        session: session.take_session()?,
        trace,
        calls: session.take_calls(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{ComponentOutcome, ComponentState};
    use crate::session::SessionStore;
    use crate::{OutboundCall, Resolution};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use switchyard_error::CallError;
    use switchyard_model::{
        BackendKind, CompiledCall, CompiledComponent, Conditional, Script, Step,
    };

    /// Echoes each descriptor back, tagged with its position.
    struct EchoDispatcher {
        seen: Mutex<Vec<OutboundCall>>,
    }

    impl EchoDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl RequestDispatcher for EchoDispatcher {
        async fn dispatch(&self, calls: Vec<OutboundCall>) -> Vec<Result<Value, CallError>> {
            self.seen.lock().unwrap().extend(calls.iter().cloned());
            calls
                .into_iter()
                .enumerate()
                .map(|(i, c)| {
                    if c.request.get("fail").is_some() {
                        Err(CallError::upstream("http", "boom"))
                    } else {
                        Ok(json!({ "index": i, "endpoint": c.remote_endpoint, "echo": c.request }))
                    }
                })
                .collect()
        }

        fn known_backends(&self) -> Vec<String> {
            vec!["http".into()]
        }
    }

    struct StaticEnv(HashMap<String, Value>);

    impl EnvironmentAccessor for StaticEnv {
        fn name(&self) -> &str {
            "test"
        }

        fn resolve(&self, name: &str) -> Resolution {
            match self.0.get(name) {
                Some(v) => Resolution::Value(v.clone()),
                None => Resolution::NotConfigured,
            }
        }
    }

    fn env() -> Arc<dyn EnvironmentAccessor> {
        Arc::new(StaticEnv(HashMap::from([(
            "greeting".to_string(),
            json!("hello"),
        )])))
    }

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(SandboxConfig {
            deadline: Duration::from_secs(10),
            ..Default::default()
        })
    }

    fn js(label: &str, source: &str) -> CompiledComponent {
        CompiledComponent {
            label: label.into(),
            conditional: None,
            before: vec![],
            step: Step::Script(Script::new(label, source)),
            after: vec![],
        }
    }

    fn call(name: &str, endpoint: &str) -> CompiledCall {
        CompiledCall {
            name: name.into(),
            remote_endpoint: endpoint.into(),
            backend: BackendKind::Http,
            conditional: None,
            before: vec![],
            after: vec![],
        }
    }

    fn pipeline(components: Vec<CompiledComponent>) -> Arc<Pipeline> {
        Arc::new(Pipeline {
            endpoint_id: "ep".into(),
            name: "test-endpoint".into(),
            version: 1,
            api: "api".into(),
            environment: "test".into(),
            libraries: vec![],
            components,
        })
    }

    fn invocation(
        pipeline: Arc<Pipeline>,
        dispatcher: Arc<dyn RequestDispatcher>,
        session: SessionHandle,
    ) -> Invocation {
        Invocation {
            request_id: "req-test".into(),
            pipeline,
            request: json!({ "method": "GET", "path": "/x", "body": "", "params": { "id": "7" } }),
            dispatcher,
            environment: env(),
            session,
        }
    }

    async fn run(components: Vec<CompiledComponent>) -> Result<PipelineOutcome, SandboxError> {
        let store = Arc::new(SessionStore::default());
        executor()
            .execute_pipeline(invocation(
                pipeline(components),
                EchoDispatcher::new(),
                SessionHandle::new(store, None),
            ))
            .await
    }

    #[tokio::test]
    async fn script_sets_final_response() {
        let out = run(vec![js(
            "component[0]",
            r#"response = new AP.HTTP.Response();
               response.statusCode = 201;
               response.setJSONBody({ id: request.params.id });"#,
        )])
        .await
        .unwrap();
        assert_eq!(out.response["statusCode"], 201);
        assert_eq!(out.response["body"], r#"{"id":"7"}"#);
        assert_eq!(out.response["headers"]["Content-Type"], "application/json");
    }

    #[tokio::test]
    async fn components_run_in_declared_order() {
        let out = run(vec![
            js("component[0]", "globalThis.order = ['a'];"),
            js("component[1]", "order.push('b');"),
            js("component[2]", "order.push('c'); response.body = order.join(',');"),
        ])
        .await
        .unwrap();
        assert_eq!(out.response["body"], "a,b,c");
        assert_eq!(out.trace.len(), 3);
    }

    #[tokio::test]
    async fn negative_guard_skips_only_its_component() {
        let mut skipped = js("component[1]", "order.push('skipped');");
        skipped.conditional = Some(Conditional {
            expression: "request.method === 'POST'".into(),
            positive: true,
        });
        let mut inverted = js("component[2]", "order.push('inverted');");
        inverted.conditional = Some(Conditional {
            expression: "request.method === 'POST'".into(),
            positive: false,
        });
        let out = run(vec![
            js("component[0]", "globalThis.order = [];"),
            skipped,
            inverted,
            js("component[3]", "response.body = order.join(',');"),
        ])
        .await
        .unwrap();
        assert_eq!(out.response["body"], "inverted");
        assert_eq!(out.trace[1].outcome, ComponentOutcome::Skipped);
        assert_eq!(
            out.trace[1].states,
            vec![ComponentState::Idle, ComponentState::EvaluatingConditional]
        );
        assert_eq!(out.trace[2].outcome, ComponentOutcome::Completed);
    }

    #[tokio::test]
    async fn stop_ends_the_pipeline() {
        let mut stopping = js("component[0]", "response.body = 'early'; return stop;");
        stopping.after = vec![Script::new("component[0].after[0]", "response.body = 'after';")];
        let out = run(vec![stopping, js("component[1]", "response.body = 'late';")])
            .await
            .unwrap();
        assert_eq!(out.response["body"], "early");
        assert_eq!(out.trace.len(), 1);
        assert_eq!(out.trace[0].outcome, ComponentOutcome::Stopped);
    }

    #[tokio::test]
    async fn multi_call_results_keep_request_order() {
        let component = CompiledComponent {
            label: "component[0]".into(),
            conditional: None,
            before: vec![Script::new(
                "component[0].before[0]",
                r#"first.request = new AP.HTTP.Request({ url: "http://a" });
                   second.request = new AP.HTTP.Request({ url: "http://b", fail: true });
                   third.request = new AP.HTTP.Request({ url: "http://c" });"#,
            )],
            step: Step::Calls(vec![call("first", "a"), call("second", "b"), call("third", "c")]),
            after: vec![Script::new(
                "component[0].after[0]",
                r#"response = new AP.HTTP.Response();
                   response.setJSONBody([first.response.index, second.response.error,
                                         second.response.code, third.response.index]);"#,
            )],
        };
        let out = run(vec![component]).await.unwrap();
        let body: Value = serde_json::from_str(out.response["body"].as_str().unwrap()).unwrap();
        assert_eq!(body, json!([0, "http error: boom", "UPSTREAM_ERROR", 2]));
        assert_eq!(out.calls.len(), 3);
        assert!(!out.calls[1].ok);
        assert_eq!(out.trace[0].calls, 3);
        assert!(out.trace[0].states.contains(&ComponentState::AwaitingResults));
    }

    #[tokio::test]
    async fn unset_call_request_passes_incoming_request_through() {
        let dispatcher = EchoDispatcher::new();
        let component = CompiledComponent {
            label: "component[0]".into(),
            conditional: None,
            before: vec![],
            step: Step::Calls(vec![call("upstream", "users")]),
            after: vec![],
        };
        let store = Arc::new(SessionStore::default());
        let out = executor()
            .execute_pipeline(invocation(
                pipeline(vec![component]),
                dispatcher.clone(),
                SessionHandle::new(store, None),
            ))
            .await
            .unwrap();

        let seen = dispatcher.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].remote_endpoint.as_deref(), Some("users"));
        assert_eq!(seen[0].request["path"], "/x");
        // A single call's response becomes the global response.
        assert_eq!(out.response["endpoint"], "users");
    }

    #[tokio::test]
    async fn call_conditional_skips_only_that_call() {
        let mut guarded = call("skipped", "b");
        guarded.conditional = Some(Conditional {
            expression: "false".into(),
            positive: true,
        });
        let component = CompiledComponent {
            label: "component[0]".into(),
            conditional: None,
            before: vec![],
            step: Step::Calls(vec![call("kept", "a"), guarded]),
            after: vec![Script::new(
                "component[0].after[0]",
                "response = { statusCode: 200, body: String(skipped.response === null) };",
            )],
        };
        let out = run(vec![component]).await.unwrap();
        assert_eq!(out.response["body"], "true");
        assert_eq!(out.calls.len(), 1);
    }

    #[tokio::test]
    async fn make_requests_from_script() {
        let out = run(vec![js(
            "component[0]",
            r#"const rs = await AP.makeRequests([
                   new AP.HTTP.Request({ url: "http://one", remoteEndpoint: "one" }),
                   new AP.HTTP.Request({ url: "http://two" })
               ]);
               const single = await AP.makeRequest(new AP.HTTP.Request({ url: "http://three" }));
               response.body = [rs[0].endpoint, rs[1].index, single.echo.url].join('|');"#,
        )])
        .await
        .unwrap();
        assert_eq!(out.response["body"], "one|1|http://three");
    }

    #[tokio::test]
    async fn script_error_is_a_script_fault_with_location() {
        let err = run(vec![js("component[0]", "null.boom;")]).await.unwrap_err();
        match err {
            SandboxError::ScriptFault { location, .. } => assert_eq!(location, "component[0]"),
            other => panic!("expected script fault, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cpu_bound_loop_hits_the_deadline() {
        let exec = SandboxExecutor::new(SandboxConfig {
            deadline: Duration::from_millis(300),
            ..Default::default()
        });
        let store = Arc::new(SessionStore::default());
        let start = Instant::now();
        let err = exec
            .execute_pipeline(invocation(
                pipeline(vec![js("component[0]", "while (true) {}")]),
                EchoDispatcher::new(),
                SessionHandle::new(store, None),
            ))
            .await
            .unwrap_err();
        assert!(err.is_deadline(), "expected deadline, got: {err:?}");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn pending_timer_hits_the_deadline() {
        let exec = SandboxExecutor::new(SandboxConfig {
            deadline: Duration::from_millis(200),
            ..Default::default()
        });
        struct SlowDispatcher;
        #[async_trait::async_trait]
        impl RequestDispatcher for SlowDispatcher {
            async fn dispatch(&self, calls: Vec<OutboundCall>) -> Vec<Result<Value, CallError>> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                calls.into_iter().map(|_| Ok(Value::Null)).collect()
            }
        }
        let store = Arc::new(SessionStore::default());
        let err = exec
            .execute_pipeline(invocation(
                pipeline(vec![js(
                    "component[0]",
                    "await AP.makeRequest(new AP.HTTP.Request({ url: 'http://slow' }));",
                )]),
                Arc::new(SlowDispatcher),
                SessionHandle::new(store, None),
            ))
            .await
            .unwrap_err();
        assert!(err.is_deadline(), "expected deadline, got: {err:?}");
    }

    #[tokio::test]
    async fn heap_limit_prevents_oom() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_heap_size: 10 * 1024 * 1024,
            deadline: Duration::from_secs(30),
            ..Default::default()
        });
        let store = Arc::new(SessionStore::default());
        let err = exec
            .execute_pipeline(invocation(
                pipeline(vec![js(
                    "component[0]",
                    r#"const arr = [];
                       while (true) { arr.push(new Array(100000).fill("x")); }"#,
                )]),
                EchoDispatcher::new(),
                SessionHandle::new(store, None),
            ))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                SandboxError::HeapLimitExceeded | SandboxError::ScriptFault { .. }
            ),
            "expected heap limit or script fault, got: {err:?}"
        );
    }

    #[tokio::test]
    async fn concurrency_limit_enforced() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_concurrent: 0,
            ..Default::default()
        });
        let store = Arc::new(SessionStore::default());
        let err = exec
            .execute_pipeline(invocation(
                pipeline(vec![]),
                EchoDispatcher::new(),
                SessionHandle::new(store, None),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ConcurrencyLimit { max: 0 }));
    }

    #[tokio::test]
    async fn call_limit_enforced() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_calls_per_request: 2,
            ..Default::default()
        });
        let store = Arc::new(SessionStore::default());
        let err = exec
            .execute_pipeline(invocation(
                pipeline(vec![js(
                    "component[0]",
                    r#"await AP.makeRequests([
                           new AP.HTTP.Request(), new AP.HTTP.Request(), new AP.HTTP.Request()
                       ]);"#,
                )]),
                EchoDispatcher::new(),
                SessionHandle::new(store, None),
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("call limit"), "{err}");
    }

    #[tokio::test]
    async fn ambient_capabilities_are_absent() {
        let out = run(vec![js(
            "component[0]",
            r#"const names = Object.getOwnPropertyNames(globalThis);
               let ctor = "blocked";
               try { ctor = typeof (function () {}).constructor; } catch (e) {}
               response.body = JSON.stringify({
                   deno: names.includes("Deno"),
                   evalType: typeof globalThis.eval,
                   fetchType: typeof globalThis.fetch,
                   ctor
               });"#,
        )])
        .await
        .unwrap();
        let body: Value = serde_json::from_str(out.response["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["deno"], false);
        assert_eq!(body["evalType"], "undefined");
        assert_eq!(body["fetchType"], "undefined");
        assert_eq!(body["ctor"], "undefined");
    }

    #[tokio::test]
    async fn capability_namespace_is_frozen() {
        let out = run(vec![js(
            "component[0]",
            r#""use strict";
               let frozen = false;
               try { AP.HTTP = null; } catch (e) { frozen = true; }
               response.body = String(frozen && Object.isFrozen(AP) && Object.isFrozen(session));"#,
        )])
        .await
        .unwrap();
        assert_eq!(out.response["body"], "true");
    }

    #[tokio::test]
    async fn env_reports_not_configured() {
        let out = run(vec![js(
            "component[0]",
            r#"response.body = [
                   env.get("greeting"),
                   env.get("missing") === env.NOT_CONFIGURED,
                   env.isConfigured("missing"),
                   env.name
               ].join(',');"#,
        )])
        .await
        .unwrap();
        assert_eq!(out.response["body"], "hello,true,false,test");
    }

    #[tokio::test]
    async fn session_writes_mint_an_id_and_persist() {
        let store = Arc::new(SessionStore::default());
        let first = executor()
            .execute_pipeline(invocation(
                pipeline(vec![js(
                    "component[0]",
                    r#"session.set("user", { name: "ada", visits: 1 });"#,
                )]),
                EchoDispatcher::new(),
                SessionHandle::new(store.clone(), None),
            ))
            .await
            .unwrap();
        assert!(first.session.needs_cookie());
        let id = first.session.id().unwrap().to_string();

        let second = executor()
            .execute_pipeline(invocation(
                pipeline(vec![js(
                    "component[0]",
                    r#"const u = session.get("user");
                       response.body = u.name + ":" + session.isSet("user") + ":" + session.get("nope");"#,
                )]),
                EchoDispatcher::new(),
                SessionHandle::new(store.clone(), Some(id)),
            ))
            .await
            .unwrap();
        assert_eq!(second.response["body"], "ada:true:null");

        let other = executor()
            .execute_pipeline(invocation(
                pipeline(vec![js(
                    "component[0]",
                    r#"response.body = String(session.isSet("user"));"#,
                )]),
                EchoDispatcher::new(),
                SessionHandle::new(store, None),
            ))
            .await
            .unwrap();
        assert_eq!(other.response["body"], "false");
        assert!(!other.session.needs_cookie());
    }

    #[tokio::test]
    async fn declarations_carry_across_components() {
        let out = run(vec![
            js("component[0]", "var x = 1;\nconst label = 'n';\nfunction twice(v) { return v * 2; }"),
            js("component[1]", "let y = twice(x);"),
            js("component[2]", "response.body = label + String(x) + String(y);"),
        ])
        .await
        .unwrap();
        assert_eq!(out.response["body"], "n12");
    }

    #[tokio::test]
    async fn declarations_survive_an_early_return() {
        let out = run(vec![
            js("component[0]", "var seen = true;\nif (seen) { return; }\nvar later = 1;"),
            js("component[1]", "response.body = String(seen) + typeof later;"),
        ])
        .await
        .unwrap();
        assert_eq!(out.response["body"], "trueundefined");
    }

    #[tokio::test]
    async fn redeclared_var_keeps_its_value() {
        let out = run(vec![
            js("component[0]", "var count = 1;"),
            js("component[1]", "var count; count++; response.body = String(count);"),
        ])
        .await
        .unwrap();
        assert_eq!(out.response["body"], "2");
    }

    #[tokio::test]
    async fn libraries_define_shared_functions() {
        let mut p = (*pipeline(vec![js("component[0]", "response.body = shout('hi');")])).clone();
        p.libraries = vec![Script::new(
            "library[strings]",
            "function shout(s) { return s.toUpperCase() + '!'; }",
        )];
        let store = Arc::new(SessionStore::default());
        let out = executor()
            .execute_pipeline(invocation(
                Arc::new(p),
                EchoDispatcher::new(),
                SessionHandle::new(store, None),
            ))
            .await
            .unwrap();
        assert_eq!(out.response["body"], "HI!");
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_response_size: 64,
            ..Default::default()
        });
        let store = Arc::new(SessionStore::default());
        let err = exec
            .execute_pipeline(invocation(
                pipeline(vec![js("component[0]", "response.body = 'x'.repeat(1000);")]),
                EchoDispatcher::new(),
                SessionHandle::new(store, None),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::OutputTooLarge { max: 64 }));
    }
}
