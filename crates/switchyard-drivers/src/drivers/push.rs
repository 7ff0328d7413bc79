//! Push notification driver.
//!
//! Devices subscribe to channels; `push` delivers a payload to every device
//! on a channel through the configured [`PushProvider`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde_json::{json, Value};
use switchyard_error::CallError;

use crate::descriptor::PushOp;
use crate::{BackendRequest, Driver};

/// Where push deliveries go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PushProvider {
    /// Record deliveries in the log.
    #[default]
    Log,
    /// POST each delivery as JSON to a webhook.
    Webhook(String),
}

/// Push driver.
pub struct PushDriver {
    provider: PushProvider,
    client: reqwest::Client,
    /// channel -> (platform, token)
    subscriptions: RwLock<BTreeMap<String, BTreeSet<(String, String)>>>,
}

impl PushDriver {
    /// A driver delivering through `provider`.
    pub fn new(provider: PushProvider) -> Self {
        Self {
            provider,
            client: reqwest::Client::new(),
            subscriptions: RwLock::new(BTreeMap::new()),
        }
    }

    fn devices(&self, channel: &str) -> Vec<(String, String)> {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn deliver(&self, channel: &str, payload: &Value) -> Result<usize, CallError> {
        let devices = self.devices(channel);
        if devices.is_empty() {
            return Ok(0);
        }
        match &self.provider {
            PushProvider::Log => {
                for (platform, token) in &devices {
                    tracing::info!(%channel, %platform, %token, %payload, "push delivered");
                }
            }
            PushProvider::Webhook(url) => {
                let body = json!({
                    "channel": channel,
                    "payload": payload,
                    "devices": devices
                        .iter()
                        .map(|(platform, token)| json!({ "platform": platform, "token": token }))
                        .collect::<Vec<_>>(),
                });
                let resp = self
                    .client
                    .post(url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| CallError::upstream("push", e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(CallError::upstream(
                        "push",
                        format!("webhook returned {}", resp.status()),
                    ));
                }
            }
        }
        Ok(devices.len())
    }

    async fn apply(&self, op: PushOp) -> Result<Value, CallError> {
        match op {
            PushOp::Push { channel, payload } => {
                let delivered = self.deliver(&channel, &payload).await?;
                Ok(json!({ "data": { "delivered": delivered } }))
            }
            PushOp::Subscribe {
                platform,
                channel,
                token,
            } => {
                let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
                let added = subs.entry(channel).or_default().insert((platform, token));
                Ok(json!({ "data": { "subscribed": added } }))
            }
            PushOp::Unsubscribe {
                platform,
                channel,
                token,
            } => {
                let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
                let removed = subs
                    .get_mut(&channel)
                    .is_some_and(|set| set.remove(&(platform, token)));
                if subs.get(&channel).is_some_and(BTreeSet::is_empty) {
                    subs.remove(&channel);
                }
                Ok(json!({ "data": { "unsubscribed": removed } }))
            }
        }
    }
}

impl Default for PushDriver {
    fn default() -> Self {
        Self::new(PushProvider::Log)
    }
}

#[async_trait::async_trait]
impl Driver for PushDriver {
    async fn execute(&self, request: BackendRequest, _connection: &Value) -> Result<Value, CallError> {
        match request {
            BackendRequest::Push(op) => self.apply(op).await,
            other => Err(CallError::invalid(
                "push",
                format!("cannot execute a {} request", other.kind()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use switchyard_model::BackendKind;

    async fn run(driver: &PushDriver, v: Value) -> Value {
        let req = BackendRequest::parse(BackendKind::Push, &v).unwrap();
        driver.execute(req, &Value::Null).await.unwrap()
    }

    #[tokio::test]
    async fn subscribe_push_unsubscribe() {
        let push = PushDriver::default();
        let sub = json!({"operation": "subscribe", "channel": "news", "platform": "ios", "token": "t1"});
        assert_eq!(run(&push, sub.clone()).await["data"]["subscribed"], true);
        assert_eq!(run(&push, sub).await["data"]["subscribed"], false);
        run(
            &push,
            json!({"operation": "subscribe", "channel": "news", "platform": "android", "token": "t2"}),
        )
        .await;

        let out = run(&push, json!({"channel": "news", "payload": {"title": "hi"}})).await;
        assert_eq!(out["data"]["delivered"], 2);

        run(
            &push,
            json!({"operation": "unsubscribe", "channel": "news", "platform": "ios", "token": "t1"}),
        )
        .await;
        let out = run(&push, json!({"channel": "news", "payload": {}})).await;
        assert_eq!(out["data"]["delivered"], 1);
        let out = run(&push, json!({"channel": "empty", "payload": {}})).await;
        assert_eq!(out["data"]["delivered"], 0);
    }

    #[tokio::test]
    async fn webhook_provider_posts_deliveries() {
        use axum::{extract::State, routing::post, Json, Router};

        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(|State(seen): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                    seen.lock().unwrap().push(body);
                    "ok"
                }),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let push = PushDriver::new(PushProvider::Webhook(format!("http://{addr}/hook")));
        run(
            &push,
            json!({"operation": "subscribe", "channel": "c", "platform": "web", "token": "x"}),
        )
        .await;
        let out = run(&push, json!({"channel": "c", "payload": {"n": 1}})).await;
        assert_eq!(out["data"]["delivered"], 1);

        let bodies = seen.lock().unwrap();
        assert_eq!(bodies[0]["devices"][0]["token"], "x");
        assert_eq!(bodies[0]["payload"]["n"], 1);
    }
}
