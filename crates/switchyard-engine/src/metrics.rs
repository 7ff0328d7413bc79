//! Prometheus metrics for the gateway.
//!
//! Only compiled with the `metrics` feature.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Label set for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// "ok", or a gateway error kind such as "routing" or "deadline".
    pub outcome: String,
}

/// Label set for backend call metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    /// Backend tag, or "unknown" when the descriptor carried none.
    pub backend: String,
    /// "ok" or "error".
    pub outcome: String,
}

/// Prometheus metrics for the gateway.
pub struct GatewayMetrics {
    /// Requests handled, by outcome.
    pub requests_total: Family<RequestLabels, Counter>,
    /// Request duration in seconds, by outcome.
    pub request_duration_seconds: Family<RequestLabels, Histogram>,
    /// Backend calls made, by backend and outcome.
    pub backend_calls_total: Family<BackendLabels, Counter>,
    /// Proxy endpoints currently serving.
    pub active_endpoints: Gauge<i64, AtomicI64>,
    /// Proxy endpoints deactivated by the last catalog load.
    pub inactive_endpoints: Gauge<i64, AtomicI64>,
}

impl GatewayMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::default();
        registry.register(
            "switchyard_requests_total",
            "Requests handled by outcome",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(
                    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter(),
                )
            });
        registry.register(
            "switchyard_request_duration_seconds",
            "Request duration",
            request_duration_seconds.clone(),
        );

        let backend_calls_total = Family::default();
        registry.register(
            "switchyard_backend_calls_total",
            "Backend calls by backend and outcome",
            backend_calls_total.clone(),
        );

        let active_endpoints = Gauge::default();
        registry.register(
            "switchyard_active_endpoints",
            "Proxy endpoints currently serving",
            active_endpoints.clone(),
        );

        let inactive_endpoints = Gauge::default();
        registry.register(
            "switchyard_inactive_endpoints",
            "Proxy endpoints deactivated by the last catalog load",
            inactive_endpoints.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            backend_calls_total,
            active_endpoints,
            inactive_endpoints,
        }
    }

    /// Record a finished request.
    pub fn record_request(&self, outcome: &str, duration_secs: f64) {
        let labels = RequestLabels {
            outcome: outcome.to_string(),
        };
        self.requests_total.get_or_create(&labels).inc();
        self.request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record one backend call.
    pub fn record_backend_call(&self, backend: Option<&str>, ok: bool) {
        let labels = BackendLabels {
            backend: backend.unwrap_or("unknown").to_string(),
            outcome: if ok { "ok" } else { "error" }.to_string(),
        };
        self.backend_calls_total.get_or_create(&labels).inc();
    }

    /// Record the result of a catalog load.
    pub fn record_catalog(&self, active: usize, inactive: usize) {
        self.active_endpoints.set(active as i64);
        self.inactive_endpoints.set(inactive as i64);
    }
}
