//! The gateway behind a real listener.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use switchyard_drivers::{DriverOptions, DriverRegistry};
use switchyard_engine::{Gateway, GatewayServer};
use switchyard_model::{Catalog, Component, ComponentKind, Environment, ProxyEndpointDefinition, RouteSpec};
use switchyard_sandbox::{SandboxConfig, SandboxExecutor, SessionStore};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn echo_catalog() -> Catalog {
    Catalog::builder()
        .environment(Environment {
            name: "test".into(),
            ..Default::default()
        })
        .proxy_endpoint(ProxyEndpointDefinition {
            id: "echo".into(),
            name: "echo".into(),
            environment: "test".into(),
            routes: vec![RouteSpec {
                methods: vec!["POST".into()],
                path: "/echo".into(),
                ..Default::default()
            }],
            components: vec![Component {
                kind: ComponentKind::Js,
                script: Some(
                    r#"response.statusCode = 201;
                       response.headers["X-Seen-Type"] = request.headers["Content-Type"];
                       response.setJSONBody({
                           got: JSON.parse(request.body),
                           from: request.remoteAddress !== ""
                       });"#
                        .into(),
                ),
                ..Default::default()
            }],
            ..Default::default()
        })
        .build()
}

struct Running {
    base: String,
    client: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start(configure: impl FnOnce(GatewayServer) -> GatewayServer, gateway: Gateway) -> Running {
    let gateway = Arc::new(gateway);
    gateway.load_catalog(Arc::new(echo_catalog()));
    let server = configure(GatewayServer::new(gateway));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel();
    tokio::spawn(server.serve(listener, async {
        let _ = stopped.await;
    }));

    Running {
        base: format!("http://{addr}"),
        client: reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap(),
        stop: Some(stop),
    }
}

fn gateway() -> Gateway {
    Gateway::new(
        Arc::new(SandboxExecutor::new(SandboxConfig::default())),
        Arc::new(DriverRegistry::with_defaults(&DriverOptions::default()).unwrap()),
        Arc::new(SessionStore::default()),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_pipelines_over_http() {
    let running = start(|s| s, gateway()).await;

    let reply = running
        .client
        .post(format!("{}/echo", running.base))
        .json(&json!({ "n": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(reply.status(), 201);
    assert_eq!(reply.headers()["x-seen-type"], "application/json");
    let body: Value = reply.json().await.unwrap();
    assert_eq!(body, json!({ "got": { "n": 1 }, "from": true }));

    let missing = running
        .client
        .get(format!("{}/echo", running.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_bodies_are_rejected() {
    let running = start(|s| s.with_max_body_bytes(8), gateway()).await;
    let reply = running
        .client
        .post(format!("{}/echo", running.base))
        .body("x".repeat(64))
        .send()
        .await
        .unwrap();
    assert_eq!(reply.status(), 413);
}

#[cfg(feature = "metrics")]
#[tokio::test(flavor = "multi_thread")]
async fn metrics_are_exposed_at_their_path() {
    use prometheus_client::registry::Registry;
    use switchyard_engine::GatewayMetrics;

    let mut registry = Registry::default();
    let metrics = Arc::new(GatewayMetrics::new(&mut registry));
    let registry = Arc::new(registry);
    let running = start(
        |s| s.with_metrics("/metrics", registry.clone()),
        gateway().with_metrics(metrics),
    )
    .await;

    running
        .client
        .post(format!("{}/echo", running.base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let text = running
        .client
        .get(format!("{}/metrics", running.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("switchyard_requests_total"));
    assert!(text.contains("switchyard_active_endpoints 1"));
}
