//! Concurrent call dispatcher.
//!
//! Each call of a step is validated, resolved against the environment's
//! connection data and spawned as its own task on the gateway runtime.
//! Results come back in call order. A call that cannot be prepared, fails,
//! times out or panics yields an error in its own slot only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use switchyard_error::CallError;
use switchyard_model::BackendKind;
use switchyard_sandbox::{OutboundCall, RequestDispatcher};
use tokio::runtime::Handle;
use tokio::task::JoinSet;

use crate::{BackendRequest, Driver, DriverRegistry};

/// A remote endpoint resolved for the current environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEndpoint {
    /// Backend kind of the endpoint.
    pub kind: BackendKind,
    /// Connection data, already merged with the environment's overrides.
    pub connection: Value,
}

/// Looks up remote endpoints by name for one environment.
pub trait ConnectionResolver: Send + Sync {
    /// `None` when the endpoint is not configured.
    fn resolve_endpoint(&self, name: &str) -> Option<ResolvedEndpoint>;
}

/// The [`RequestDispatcher`] handed to Sandbox Sessions.
///
/// Backend tasks run on `handle`, the long-lived gateway runtime, not on the
/// short-lived runtime that drives a sandbox session. Pooled clients stay
/// bound to one runtime that way.
pub struct CallDispatcher {
    registry: Arc<DriverRegistry>,
    connections: Arc<dyn ConnectionResolver>,
    handle: Handle,
}

struct Prepared {
    driver: Arc<dyn Driver>,
    request: BackendRequest,
    connection: Value,
}

impl CallDispatcher {
    /// Create a dispatcher for one environment.
    pub fn new(
        registry: Arc<DriverRegistry>,
        connections: Arc<dyn ConnectionResolver>,
        handle: Handle,
    ) -> Self {
        Self {
            registry,
            connections,
            handle,
        }
    }

    fn prepare(&self, call: OutboundCall) -> Result<Prepared, CallError> {
        let declared = match call.request.get("__type").and_then(Value::as_str) {
            Some(tag) => Some(
                tag.parse::<BackendKind>()
                    .map_err(|_| CallError::BackendNotRegistered(tag.to_string()))?,
            ),
            None => None,
        };

        let (kind, connection) = match &call.remote_endpoint {
            Some(name) => {
                let resolved = self.connections.resolve_endpoint(name).ok_or_else(|| {
                    CallError::NotConfigured {
                        remote_endpoint: name.clone(),
                    }
                })?;
                if let Some(declared) = declared {
                    if declared != resolved.kind {
                        return Err(CallError::invalid(
                            declared.as_str(),
                            format!(
                                "remote endpoint '{name}' is a {} backend",
                                resolved.kind
                            ),
                        ));
                    }
                }
                (resolved.kind, resolved.connection)
            }
            None => match declared {
                Some(kind) => (kind, Value::Object(Default::default())),
                None => {
                    return Err(CallError::invalid(
                        "unknown",
                        "call names no remote endpoint and its request has no type",
                    ))
                }
            },
        };

        let driver = self
            .registry
            .get(kind)
            .cloned()
            .ok_or_else(|| CallError::BackendNotRegistered(kind.as_str().to_string()))?;
        let request = BackendRequest::parse(kind, &call.request)?;
        Ok(Prepared {
            driver,
            request,
            connection,
        })
    }
}

#[async_trait::async_trait]
impl RequestDispatcher for CallDispatcher {
    async fn dispatch(&self, calls: Vec<OutboundCall>) -> Vec<Result<Value, CallError>> {
        let mut slots: Vec<Option<Result<Value, CallError>>> = Vec::with_capacity(calls.len());
        let mut by_backend: BTreeMap<&'static str, usize> = BTreeMap::new();
        // Dropping the set aborts every call still in flight.
        let mut tasks = JoinSet::new();

        for (index, call) in calls.into_iter().enumerate() {
            match self.prepare(call) {
                Ok(Prepared {
                    driver,
                    request,
                    connection,
                }) => {
                    let backend = request.kind();
                    *by_backend.entry(backend.as_str()).or_default() += 1;
                    slots.push(None);
                    tasks.spawn_on(
                        async move {
                            let start = Instant::now();
                            let result = driver.execute(request, &connection).await;
                            tracing::debug!(
                                index,
                                %backend,
                                duration_ms = start.elapsed().as_millis() as u64,
                                ok = result.is_ok(),
                                "backend call finished"
                            );
                            (index, result)
                        },
                        &self.handle,
                    );
                }
                Err(e) => {
                    tracing::debug!(index, error = %e, "call rejected before dispatch");
                    slots.push(Some(Err(e)));
                }
            }
        }
        tracing::debug!(?by_backend, "dispatching calls");

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "backend call task failed"),
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(CallError::Internal(anyhow::anyhow!("backend call task failed")))
                })
            })
            .collect()
    }

    fn known_backends(&self) -> Vec<String> {
        self.registry.tags().into_iter().map(String::from).collect()
    }
}
