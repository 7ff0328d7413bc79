//! The gateway: catalog snapshot, request handling and job execution.
//!
//! A [`Gateway`] serves from an immutable [`Snapshot`] of the catalog,
//! its compiled endpoints and the route table. Loading a catalog builds a
//! new snapshot and swaps it in atomically; requests already running keep
//! the snapshot they started with.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use serde_json::{json, Map, Value};
use switchyard_drivers::drivers::{JobDriver, JobRunner};
use switchyard_drivers::{CallDispatcher, DriverRegistry};
use switchyard_model::{Catalog, CorsSettings, SessionSettings};
use switchyard_sandbox::redact::redact_error_message;
use switchyard_sandbox::{Invocation, PipelineOutcome, SandboxExecutor, SessionHandle, SessionStore};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cookie::{self, CookieSigner};
use crate::cors;
use crate::environment::EnvironmentResolver;
use crate::error::{CompilationError, GatewayError};
use crate::loader::{CompiledEndpoint, PipelineLoader};
#[cfg(feature = "metrics")]
use crate::metrics::GatewayMetrics;
use crate::request::{InboundRequest, WireResponse};
use crate::routing::RouteTable;

/// Default header carrying an inbound correlation id.
pub const DEFAULT_REQUEST_ID_HEADER: &str = "x-request-id";

/// Everything one catalog publication compiles to.
pub struct Snapshot {
    catalog: Arc<Catalog>,
    environments: EnvironmentResolver,
    routes: RouteTable,
    endpoints: HashMap<String, Arc<CompiledEndpoint>>,
    inactive: BTreeMap<String, CompilationError>,
}

impl Snapshot {
    fn empty() -> Self {
        let catalog = Arc::new(Catalog::default());
        Self {
            environments: EnvironmentResolver::new(catalog.clone()),
            catalog,
            routes: RouteTable::new(),
            endpoints: HashMap::new(),
            inactive: BTreeMap::new(),
        }
    }

    /// The catalog this snapshot was built from.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// The live route table.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Compiled endpoint by id, if it is serving.
    pub fn endpoint(&self, id: &str) -> Option<&Arc<CompiledEndpoint>> {
        self.endpoints.get(id)
    }

    /// Why an endpoint was deactivated, if it was.
    pub fn inactive(&self, id: &str) -> Option<&CompilationError> {
        self.inactive.get(id)
    }
}

/// Result of loading a catalog.
#[derive(Debug, Clone, Default)]
pub struct ReloadReport {
    /// Endpoints now serving.
    pub active: usize,
    /// Route count of the new table.
    pub routes: usize,
    /// Endpoints that failed to compile, by id.
    pub inactive: BTreeMap<String, CompilationError>,
}

/// The proxy-endpoint execution engine.
pub struct Gateway {
    executor: Arc<SandboxExecutor>,
    drivers: Arc<DriverRegistry>,
    sessions: Arc<SessionStore>,
    loader: PipelineLoader,
    snapshot: ArcSwap<Snapshot>,
    request_id_header: String,
    fallback_key: Vec<u8>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<GatewayMetrics>>,
}

struct Served {
    reply: WireResponse,
    outcome: &'static str,
    endpoint: Option<String>,
    backend_ms: u64,
}

impl Gateway {
    /// A gateway with an empty catalog.
    pub fn new(
        executor: Arc<SandboxExecutor>,
        drivers: Arc<DriverRegistry>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        let mut fallback_key = Uuid::new_v4().as_bytes().to_vec();
        fallback_key.extend_from_slice(Uuid::new_v4().as_bytes());
        Self {
            executor,
            drivers,
            sessions,
            loader: PipelineLoader::default(),
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
            request_id_header: DEFAULT_REQUEST_ID_HEADER.to_string(),
            fallback_key,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Use `loader` for compilation, e.g. one with a different script size cap.
    pub fn with_loader(mut self, loader: PipelineLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Read inbound correlation ids from `header`.
    pub fn with_request_id_header(mut self, header: impl Into<String>) -> Self {
        self.request_id_header = header.into();
        self
    }

    /// Record request and backend metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind this gateway as the job driver's runner.
    pub fn bind_jobs(self: &Arc<Self>, jobs: &JobDriver) {
        let runner: Arc<dyn JobRunner> = self.clone();
        jobs.bind(Arc::downgrade(&runner));
    }

    /// The snapshot requests are currently served from.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// The session store.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Compile every active endpoint of `catalog` and swap the result in.
    ///
    /// Every publication invalidates the whole pipeline cache, since a shared
    /// component can change without the referencing endpoint's version
    /// changing. An endpoint that fails to compile is deactivated; the rest
    /// of the catalog still goes live.
    pub fn load_catalog(&self, catalog: Arc<Catalog>) -> ReloadReport {
        self.loader.invalidate();

        let mut routes = RouteTable::new();
        let mut endpoints = HashMap::new();
        let mut inactive = BTreeMap::new();
        for definition in catalog.proxy_endpoints.iter().filter(|d| d.active) {
            match self.loader.load(&catalog, definition) {
                Ok(compiled) => {
                    for route in &compiled.routes {
                        routes.push(route.clone());
                    }
                    endpoints.insert(definition.id.clone(), compiled);
                }
                Err(error) => {
                    tracing::error!(
                        endpoint = %definition.name,
                        id = %definition.id,
                        %error,
                        "proxy endpoint deactivated"
                    );
                    inactive.insert(definition.id.clone(), error);
                }
            }
        }

        let report = ReloadReport {
            active: endpoints.len(),
            routes: routes.len(),
            inactive: inactive.clone(),
        };
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_catalog(report.active, report.inactive.len());
        }

        self.snapshot.store(Arc::new(Snapshot {
            environments: EnvironmentResolver::new(catalog.clone()),
            catalog,
            routes,
            endpoints,
            inactive,
        }));
        tracing::info!(
            active = report.active,
            inactive = report.inactive.len(),
            routes = report.routes,
            "catalog loaded"
        );
        report
    }

    /// Reload on every catalog publication until the sender goes away.
    pub fn follow(self: &Arc<Self>, mut catalogs: watch::Receiver<Arc<Catalog>>) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            while catalogs.changed().await.is_ok() {
                let catalog = catalogs.borrow_and_update().clone();
                gateway.load_catalog(catalog);
            }
            tracing::debug!("catalog channel closed");
        })
    }

    /// Handle one inbound request.
    pub async fn handle(&self, request: InboundRequest) -> WireResponse {
        let started = Instant::now();
        let request_id = request
            .header(&self.request_id_header)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let snapshot = self.snapshot.load_full();

        let served = self.route(&snapshot, &request, &request_id).await;

        let total_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            request_id = %request_id,
            endpoint = served.endpoint.as_deref().unwrap_or("-"),
            method = %request.method,
            path = %request.path,
            status = served.reply.status,
            outcome = served.outcome,
            total_ms,
            processing_ms = total_ms.saturating_sub(served.backend_ms),
            backend_ms = served.backend_ms,
            "request complete"
        );
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_request(served.outcome, started.elapsed().as_secs_f64());
        }
        served.reply
    }

    async fn route(&self, snapshot: &Snapshot, request: &InboundRequest, request_id: &str) -> Served {
        let query = request.query_pairs();
        let Some(matched) = snapshot.routes.find(&request.route_view(&query)) else {
            let error = GatewayError::RoutingFailure {
                method: request.method.clone(),
                path: request.path.clone(),
            };
            tracing::debug!(request_id, %error, "no route");
            return Served {
                reply: error_reply(&error, false),
                outcome: error.kind(),
                endpoint: None,
                backend_ms: 0,
            };
        };
        let route = matched.route;

        let Some(endpoint) = snapshot.endpoints.get(route.endpoint_id()) else {
            let error = GatewayError::Internal(format!(
                "route points at unknown endpoint '{}'",
                route.endpoint_id()
            ));
            tracing::error!(request_id, %error, "route table out of sync");
            return Served {
                reply: error_reply(&error, false),
                outcome: error.kind(),
                endpoint: None,
                backend_ms: 0,
            };
        };
        let pipeline = &endpoint.pipeline;
        tracing::info!(
            request_id,
            endpoint = %pipeline.name,
            route = route.name().unwrap_or(route.path()),
            method = %request.method,
            path = %request.path,
            "route"
        );

        let cors_settings = snapshot
            .catalog
            .api(&pipeline.api)
            .map(|api| api.cors.clone())
            .unwrap_or_default();

        if request.method.eq_ignore_ascii_case("OPTIONS") && !route.handles_options() {
            let methods = snapshot.routes.allowed_methods(route.path());
            let mut reply = WireResponse::empty(200);
            reply.headers = cors::preflight_headers(&cors_settings, &methods);
            return Served {
                reply,
                outcome: "preflight",
                endpoint: Some(pipeline.name.clone()),
                backend_ms: 0,
            };
        }

        let mut served = self
            .execute(snapshot, endpoint, request, request_id, &matched.vars)
            .await;
        if endpoint.cors_enabled {
            add_cors(&mut served.reply, &cors_settings);
        }
        served
    }

    async fn execute(
        &self,
        snapshot: &Snapshot,
        endpoint: &CompiledEndpoint,
        request: &InboundRequest,
        request_id: &str,
        vars: &BTreeMap<String, String>,
    ) -> Served {
        let pipeline = &endpoint.pipeline;
        let environment = snapshot.catalog.environment(&pipeline.environment);
        let settings: SessionSettings = environment.map(|e| e.session.clone()).unwrap_or_default();
        let show_script_errors = environment.is_some_and(|e| e.show_script_errors);

        let signer = CookieSigner::new(&settings, &self.fallback_key);
        let session_id = cookie::read_cookie(&request.headers, &settings.cookie_name)
            .and_then(|value| signer.verify(&value));
        let session = SessionHandle::new(self.sessions.clone(), session_id);

        let scoped = snapshot.environments.scoped(&pipeline.environment);
        let dispatcher = Arc::new(CallDispatcher::new(
            self.drivers.clone(),
            scoped.clone(),
            Handle::current(),
        ));
        let query = request.query_pairs();
        let invocation = Invocation {
            request_id: request_id.to_string(),
            pipeline: pipeline.clone(),
            request: request.script_object(request_id, &query, vars),
            dispatcher,
            environment: scoped,
            session,
        };

        let result = self
            .executor
            .execute_pipeline(invocation)
            .await
            .map_err(GatewayError::from)
            .and_then(|outcome| {
                let backend_ms = self.record_calls(request_id, &outcome);
                let mut reply = WireResponse::from_script(&outcome.response)?;
                if let Some(set_cookie) = cookie::set_cookie(&settings, &signer, &outcome.session) {
                    reply.headers.push(("Set-Cookie".to_string(), set_cookie));
                }
                Ok((reply, backend_ms))
            });

        match result {
            Ok((reply, backend_ms)) => Served {
                reply,
                outcome: "ok",
                endpoint: Some(pipeline.name.clone()),
                backend_ms,
            },
            Err(error) => {
                tracing::error!(
                    request_id,
                    endpoint = %pipeline.name,
                    kind = error.kind(),
                    %error,
                    "request failed"
                );
                Served {
                    reply: error_reply(&error, show_script_errors),
                    outcome: error.kind(),
                    endpoint: Some(pipeline.name.clone()),
                    backend_ms: 0,
                }
            }
        }
    }

    /// Log every backend call; returns the summed wall time of the steps.
    fn record_calls(&self, request_id: &str, outcome: &PipelineOutcome) -> u64 {
        let mut step_ms: BTreeMap<usize, u64> = BTreeMap::new();
        for (index, call) in outcome.calls.iter().enumerate() {
            tracing::info!(
                request_id,
                index,
                step = call.step,
                backend = call.backend.as_deref().unwrap_or("unknown"),
                remote_endpoint = call.remote_endpoint.as_deref().unwrap_or("-"),
                duration_ms = call.duration_ms,
                ok = call.ok,
                "backend call"
            );
            step_ms.insert(call.step, call.duration_ms);
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_backend_call(call.backend.as_deref(), call.ok);
            }
        }
        step_ms.values().sum()
    }
}

#[async_trait::async_trait]
impl JobRunner for Gateway {
    async fn run_job(&self, name: &str, attributes: Map<String, Value>) -> Result<Value, String> {
        let snapshot = self.snapshot.load_full();
        let definition = snapshot
            .catalog
            .proxy_endpoint_by_name(name)
            .ok_or_else(|| format!("no proxy endpoint named '{name}'"))?;
        let endpoint = snapshot
            .endpoints
            .get(&definition.id)
            .ok_or_else(|| format!("proxy endpoint '{name}' is not active"))?;

        let path = endpoint.routes.first().map(|r| r.path()).unwrap_or("/");
        let request = InboundRequest::new("POST", path)
            .with_header("Content-Type", "application/json")
            .with_body(Value::Object(attributes).to_string());
        let request_id = Uuid::new_v4().to_string();
        tracing::info!(request_id = %request_id, job = name, "job started");

        let served = self
            .execute(&snapshot, endpoint, &request, &request_id, &BTreeMap::new())
            .await;
        let body = served.reply.text();
        if served.reply.status >= 400 {
            return Err(format!(
                "job '{name}' failed with status {}: {body}",
                served.reply.status
            ));
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

fn add_cors(reply: &mut WireResponse, settings: &CorsSettings) {
    for (name, value) in cors::common_headers(settings) {
        if reply.header(&name).is_none() {
            reply.headers.push((name, value));
        }
    }
}

/// The generic error body for `error`. Script fault messages are only shown,
/// redacted, when the environment allows it.
fn error_reply(error: &GatewayError, show_script_errors: bool) -> WireResponse {
    let message = match error {
        GatewayError::RoutingFailure { .. } => "not found".to_string(),
        GatewayError::ScriptFault { location, message } if show_script_errors => {
            redact_error_message(&format!("{location}: {message}"))
        }
        GatewayError::DeadlineExceeded { .. } => "request timed out".to_string(),
        GatewayError::Overloaded(_) => "service unavailable".to_string(),
        _ => "internal server error".to_string(),
    };
    WireResponse::json(error.status(), &json!({ "error": message }))
}
