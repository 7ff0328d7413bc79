//! deno_core op definitions for the Switchyard sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; the functions and types are documented below.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use serde::Deserialize;
use serde_json::Value;
use switchyard_error::CallError;

use crate::session::{CookieOptions, SessionHandle};
use crate::{EnvironmentAccessor, OutboundCall, RequestDispatcher, Resolution};

/// Per-request cap on backend calls.
pub struct CallLimits {
    /// Maximum number of backend calls allowed.
    pub max_calls: usize,
    /// Number of backend calls made so far.
    pub calls_made: usize,
}

/// Wrapper for snippet results stored in OpState.
pub struct ExecutionResult(pub String);

/// The inbound request as JSON, read once by the bootstrap.
pub struct IncomingRequest(pub String);

/// Correlation data attached to script log lines.
pub struct RequestContext {
    /// Per-request correlation id.
    pub request_id: String,
    /// Proxy endpoint name.
    pub endpoint: String,
}

/// One backend call as seen from the sandbox, for the audit record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CallRecord {
    /// Backend tag declared by the descriptor, if any.
    pub backend: Option<String>,
    /// Remote endpoint named by the call, if any.
    pub remote_endpoint: Option<String>,
    /// Index of the fan-out step the call belonged to.
    pub step: usize,
    /// Wall time of that step.
    pub duration_ms: u64,
    /// Whether the call produced a response rather than an error placeholder.
    pub ok: bool,
}

/// Accumulated [`CallRecord`]s for the request.
#[derive(Default)]
pub struct CallRecords(pub Vec<CallRecord>);

#[derive(Deserialize)]
struct ScriptCall {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    request: Value,
}

/// Log a line from script, tagged with the request's correlation id.
#[op2(fast)]
pub fn op_sy_log(state: &mut OpState, #[string] msg: &str) {
    match state.try_borrow::<RequestContext>() {
        Some(ctx) => tracing::info!(
            target: "switchyard::sandbox::js",
            request_id = %ctx.request_id,
            endpoint = %ctx.endpoint,
            "{}",
            msg
        ),
        None => tracing::info!(target: "switchyard::sandbox::js", "{}", msg),
    }
}

/// Store a snippet result in OpState.
#[op2(fast)]
pub fn op_sy_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ExecutionResult(json.to_string()));
}

/// Hand the inbound request to the bootstrap.
#[op2]
#[string]
pub fn op_sy_request_json(state: &mut OpState) -> String {
    state
        .try_borrow::<IncomingRequest>()
        .map(|r| r.0.clone())
        .unwrap_or_else(|| "{}".to_string())
}

/// Dispatch one step's backend calls through the [`RequestDispatcher`].
///
/// Resolves to a JSON array with one entry per call, in call order. Failed
/// calls hold a [`CallError`] placeholder. Enforces [`CallLimits`].
#[op2(async)]
#[string]
pub async fn op_sy_make_requests(
    op_state: Rc<RefCell<OpState>>,
    #[string] calls_json: String,
) -> Result<String, JsErrorBox> {
    let calls: Vec<ScriptCall> = serde_json::from_str(&calls_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid request descriptors: {e}")))?;

    {
        let mut st = op_state.borrow_mut();
        let limits = st.borrow_mut::<CallLimits>();
        if limits.calls_made + calls.len() > limits.max_calls {
            return Err(JsErrorBox::generic(format!(
                "backend call limit exceeded (max {} calls per request)",
                limits.max_calls
            )));
        }
        limits.calls_made += calls.len();
    }

    let dispatcher = {
        let st = op_state.borrow();
        st.borrow::<Arc<dyn RequestDispatcher>>().clone()
    };

    let outbound: Vec<OutboundCall> = calls
        .into_iter()
        .map(|c| OutboundCall {
            remote_endpoint: c.endpoint,
            request: c.request,
        })
        .collect();
    let meta: Vec<(Option<String>, Option<String>)> = outbound
        .iter()
        .map(|c| {
            let backend = c
                .request
                .get("__type")
                .and_then(Value::as_str)
                .map(String::from);
            (backend, c.remote_endpoint.clone())
        })
        .collect();
    let expected = outbound.len();

    tracing::debug!(calls = expected, "backend calls dispatched");
    let start = Instant::now();
    let mut results = dispatcher.dispatch(outbound).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    if results.len() != expected {
        tracing::error!(
            expected,
            got = results.len(),
            "dispatcher returned a mismatched result count"
        );
        results.resize_with(expected, || {
            Err(CallError::Internal(anyhow::anyhow!("no result for call")))
        });
    }

    let step = {
        let st = op_state.borrow();
        st.try_borrow::<CallRecords>()
            .and_then(|rec| rec.0.last())
            .map_or(0, |last| last.step + 1)
    };
    let known = dispatcher.known_backends();
    let known: Vec<&str> = known.iter().map(String::as_str).collect();
    let mut records = Vec::with_capacity(expected);
    let values: Vec<Value> = results
        .into_iter()
        .zip(meta)
        .map(|(result, (backend, remote_endpoint))| {
            records.push(CallRecord {
                backend,
                remote_endpoint,
                step,
                duration_ms,
                ok: result.is_ok(),
            });
            match result {
                Ok(value) => value,
                Err(e) => e.to_placeholder(Some(&known)),
            }
        })
        .collect();

    {
        let mut st = op_state.borrow_mut();
        if let Some(rec) = st.try_borrow_mut::<CallRecords>() {
            rec.0.extend(records);
        }
    }

    serde_json::to_string(&values)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

/// Read a session value. Resolves to `null` when absent.
#[op2]
#[string]
pub fn op_sy_session_get(state: &mut OpState, #[string] key: &str) -> String {
    state
        .try_borrow::<SessionHandle>()
        .and_then(|s| s.get(key))
        .and_then(|v| serde_json::to_string(&v).ok())
        .unwrap_or_else(|| "null".to_string())
}

/// Whether the session holds a value for the key.
#[op2(fast)]
pub fn op_sy_session_is_set(state: &mut OpState, #[string] key: &str) -> bool {
    state
        .try_borrow::<SessionHandle>()
        .is_some_and(|s| s.is_set(key))
}

/// Store a session value.
#[op2(fast)]
pub fn op_sy_session_set(
    state: &mut OpState,
    #[string] key: &str,
    #[string] value_json: &str,
) -> Result<(), JsErrorBox> {
    let value: Value = serde_json::from_str(value_json)
        .map_err(|e| JsErrorBox::generic(format!("session value is not serializable: {e}")))?;
    let session = state
        .try_borrow_mut::<SessionHandle>()
        .ok_or_else(|| JsErrorBox::generic("no session bound to this request"))?;
    session
        .set(key, value)
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Remove a session value.
#[op2(fast)]
pub fn op_sy_session_delete(state: &mut OpState, #[string] key: &str) -> bool {
    state
        .try_borrow_mut::<SessionHandle>()
        .is_some_and(|s| s.delete(key))
}

/// Set the session cookie options.
#[op2(fast)]
pub fn op_sy_session_set_options(
    state: &mut OpState,
    #[string] options_json: &str,
) -> Result<(), JsErrorBox> {
    let options: CookieOptions = serde_json::from_str(options_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid session options: {e}")))?;
    let session = state
        .try_borrow_mut::<SessionHandle>()
        .ok_or_else(|| JsErrorBox::generic("no session bound to this request"))?;
    session.set_options(options);
    Ok(())
}

/// Resolve an environment value.
///
/// Resolves to `{"configured":true,"value":...}` or `{"configured":false}`.
#[op2]
#[string]
pub fn op_sy_env_get(state: &mut OpState, #[string] name: &str) -> String {
    let resolution = state
        .try_borrow::<Arc<dyn EnvironmentAccessor>>()
        .map(|env| env.resolve(name))
        .unwrap_or(Resolution::NotConfigured);
    match resolution {
        Resolution::Value(value) => {
            serde_json::json!({ "configured": true, "value": value }).to_string()
        }
        Resolution::NotConfigured => r#"{"configured":false}"#.to_string(),
    }
}

/// Name of the request's environment.
#[op2]
#[string]
pub fn op_sy_env_name(state: &mut OpState) -> String {
    state
        .try_borrow::<Arc<dyn EnvironmentAccessor>>()
        .map(|env| env.name().to_string())
        .unwrap_or_default()
}

deno_core::extension!(
    switchyard_ext,
    ops = [
        op_sy_log,
        op_sy_set_result,
        op_sy_request_json,
        op_sy_make_requests,
        op_sy_session_get,
        op_sy_session_is_set,
        op_sy_session_set,
        op_sy_session_delete,
        op_sy_session_set_options,
        op_sy_env_get,
        op_sy_env_name
    ],
);
