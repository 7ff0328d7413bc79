//! HTTP driver.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use switchyard_error::CallError;

use crate::descriptor::{flatten_pairs, HttpRequest};
use crate::{BackendRequest, Driver};

/// Headers never forwarded from a descriptor, so a passed-through inbound
/// request does not leak transport details upstream.
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "te",
    "trailer",
];

/// Calls HTTP services with a shared connection pool.
pub struct HttpDriver {
    client: Client,
    insecure_client: Client,
}

impl HttpDriver {
    /// Build the driver's clients.
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let insecure_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            insecure_client,
        })
    }
}

/// Merge endpoint-level and request-level maps; request values win.
fn merged(connection: &Value, field: &str, overrides: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let mut out: BTreeMap<String, Value> = connection
        .get(field)
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    for (k, v) in overrides {
        out.insert(k.clone(), v.clone());
    }
    out
}

pub(crate) fn build_headers(
    backend: &str,
    pairs: Vec<(String, String)>,
) -> Result<HeaderMap, CallError> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| CallError::invalid(backend, format!("invalid header name '{name}'")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| CallError::invalid(backend, format!("invalid value for header '{name}'")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

pub(crate) async fn into_response(backend: &str, resp: reqwest::Response) -> Result<Value, CallError> {
    let status = resp.status().as_u16();
    let mut headers = Map::new();
    for (name, value) in resp.headers() {
        let value = Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned());
        match headers.get_mut(name.as_str()) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                headers.insert(name.as_str().to_string(), value);
            }
        }
    }
    let body = resp
        .text()
        .await
        .map_err(|e| CallError::upstream(backend, format!("failed to read response body: {e}")))?;
    Ok(serde_json::json!({
        "statusCode": status,
        "headers": headers,
        "body": body,
    }))
}

impl HttpDriver {
    async fn send(&self, req: HttpRequest, connection: &Value) -> Result<Value, CallError> {
        let url = req
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| connection.get("url").and_then(Value::as_str).map(String::from))
            .ok_or_else(|| CallError::invalid("http", "url is required"))?;
        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|_| CallError::invalid("http", format!("invalid method '{}'", req.method)))?;

        let query = flatten_pairs(&merged(connection, "query", &req.query));
        let mut headers = build_headers("http", flatten_pairs(&merged(connection, "headers", &req.headers)))?;

        let insecure = connection
            .get("skipSslVerification")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let client = if insecure {
            &self.insecure_client
        } else {
            &self.client
        };

        let body = match req.body {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                Some(other.to_string())
            }
        };

        let mut builder = client.request(method, &url).headers(headers);
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(|e| {
            CallError::upstream("http", format!("request failed: {}", e.without_url()))
        })?;
        into_response("http", resp).await
    }
}

#[async_trait::async_trait]
impl Driver for HttpDriver {
    async fn execute(&self, request: BackendRequest, connection: &Value) -> Result<Value, CallError> {
        match request {
            BackendRequest::Http(req) => self.send(req, connection).await,
            other => Err(CallError::invalid(
                "http",
                format!("cannot execute a {} request", other.kind()),
            )),
        }
    }
}
