//! HTTP front end.
//!
//! Every path goes to the gateway through a fallback handler; routes are
//! not known to axum. The metrics endpoint, when enabled, is the only
//! route axum matches itself.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::HOST;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;

use crate::gateway::Gateway;
use crate::request::{InboundRequest, WireResponse};

/// Default cap on inbound request bodies.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
struct ServerState {
    gateway: Arc<Gateway>,
    max_body_bytes: usize,
}

/// Serves a [`Gateway`] over HTTP.
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    max_body_bytes: usize,
    #[cfg(feature = "metrics")]
    metrics: Option<(String, Arc<prometheus_client::registry::Registry>)>,
}

impl GatewayServer {
    /// A server for `gateway`.
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Reject bodies larger than `max` bytes with 413.
    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Expose `registry` in OpenMetrics text format at `path`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(
        mut self,
        path: impl Into<String>,
        registry: Arc<prometheus_client::registry::Registry>,
    ) -> Self {
        self.metrics = Some((path.into(), registry));
        self
    }

    /// The axum router.
    pub fn router(&self) -> Router {
        let state = ServerState {
            gateway: self.gateway.clone(),
            max_body_bytes: self.max_body_bytes,
        };
        #[allow(unused_mut)]
        let mut router = Router::new();
        #[cfg(feature = "metrics")]
        if let Some((path, registry)) = &self.metrics {
            let registry = registry.clone();
            router = router.route(
                path,
                axum::routing::get(move || {
                    let registry = registry.clone();
                    async move { render_metrics(&registry) }
                }),
            );
        }
        router.fallback(handle).with_state(state)
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "gateway listening");
        }
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

async fn handle(State(state): State<ServerState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::debug!(%error, "request body rejected");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                axum::Json(json!({ "error": "request body too large" })),
            )
                .into_response();
        }
    };

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (canonical_header_name(name.as_str()), v.to_string()))
        })
        .collect();
    let host = parts
        .headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or_default()
        .to_string();
    let scheme = parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.scheme_str())
        .unwrap_or("http")
        .to_ascii_lowercase();
    let remote_address = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());

    let inbound = InboundRequest {
        method: parts.method.as_str().to_string(),
        scheme,
        host,
        path: parts.uri.path().to_string(),
        raw_query: parts.uri.query().unwrap_or_default().to_string(),
        headers,
        body: body.to_vec(),
        remote_address,
    };
    to_response(state.gateway.handle(inbound).await)
}

fn to_response(reply: WireResponse) -> Response {
    let mut builder = axum::http::Response::builder().status(reply.status);
    for (name, value) in &reply.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Body::from(reply.body)).unwrap_or_else(|error| {
        tracing::error!(%error, "pipeline produced an invalid response");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({ "error": "internal server error" })),
        )
            .into_response()
    })
}

/// `content-type` -> `Content-Type`.
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(feature = "metrics")]
fn render_metrics(registry: &prometheus_client::registry::Registry) -> Response {
    let mut buffer = String::new();
    match prometheus_client::encoding::text::encode(&mut buffer, registry) {
        Ok(()) => (
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buffer,
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%error, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
