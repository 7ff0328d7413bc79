//! Wire-level request and response.
//!
//! [`InboundRequest`] is what the server hands the gateway; it becomes the
//! `request` object script sees. [`WireResponse`] is built from the final
//! script `response` object, or from a [`GatewayError`].

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::GatewayError;
use crate::routing::RouteRequest;

/// An inbound HTTP request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Request method.
    pub method: String,
    /// `http` or `https`.
    pub scheme: String,
    /// `Host` header value.
    pub host: String,
    /// URL path.
    pub path: String,
    /// Raw query string, without `?`.
    pub raw_query: String,
    /// Header pairs in arrival order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
    /// Peer address, when known.
    pub remote_address: Option<String>,
}

impl InboundRequest {
    /// A request with no headers, query or body.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            scheme: "http".into(),
            host: "localhost".into(),
            path: path.into(),
            raw_query: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
            remote_address: None,
        }
    }

    /// Set the raw query string.
    pub fn with_query(mut self, raw_query: impl Into<String>) -> Self {
        self.raw_query = raw_query.into();
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decoded query pairs.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.raw_query.as_bytes())
            .into_owned()
            .collect()
    }

    /// Decoded form pairs, for form-encoded bodies.
    fn form_pairs(&self) -> Vec<(String, String)> {
        let is_form = self
            .header("content-type")
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if !is_form {
            return Vec::new();
        }
        url::form_urlencoded::parse(&self.body).into_owned().collect()
    }

    /// The predicates a route tests, borrowing `query` for its lifetime.
    pub fn route_view<'a>(&'a self, query: &'a [(String, String)]) -> RouteRequest<'a> {
        RouteRequest {
            method: &self.method,
            host: &self.host,
            path: &self.path,
            scheme: &self.scheme,
            headers: &self.headers,
            query,
        }
    }

    /// The `request` object exposed to script.
    pub fn script_object(
        &self,
        id: &str,
        query: &[(String, String)],
        vars: &BTreeMap<String, String>,
    ) -> Value {
        let form = self.form_pairs();
        let vars_pairs: Vec<(String, String)> =
            vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let uri = if self.raw_query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.raw_query)
        };

        json!({
            "__type": "http",
            "id": id,
            "method": self.method,
            "host": self.host,
            "uri": uri,
            "path": self.path,
            "rawQuery": self.raw_query,
            "body": String::from_utf8_lossy(&self.body),
            "remoteAddress": self.remote_address.clone().unwrap_or_default(),
            "contentLength": self.body.len(),
            "headers": deslice(&[&self.headers]),
            "form": deslice(&[&form]),
            "query": deslice(&[query]),
            "vars": vars,
            "params": deslice(&[&form, query, &vars_pairs]),
        })
    }
}

/// Collapse pairs into an object: one value stays a string, several become
/// an array. Repeated identical values across sources are kept once.
fn deslice(sources: &[&[(String, String)]]) -> Value {
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for source in sources {
        for (k, v) in source.iter() {
            let values = grouped.entry(k.as_str()).or_default();
            if !values.contains(&v.as_str()) {
                values.push(v.as_str());
            }
        }
    }
    let map: Map<String, Value> = grouped
        .into_iter()
        .map(|(k, values)| {
            let value = match values.as_slice() {
                [single] => Value::String((*single).to_string()),
                many => Value::Array(many.iter().map(|v| Value::String(v.to_string())).collect()),
            };
            (k.to_string(), value)
        })
        .collect();
    Value::Object(map)
}

/// A reply ready to go on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireResponse {
    /// HTTP status.
    pub status: u16,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl WireResponse {
    /// A JSON reply.
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.to_string().into_bytes(),
        }
    }

    /// An empty reply.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Convert the script's final `response` object.
    ///
    /// `statusCode` defaults to 200. A string body is sent as is; any other
    /// non-null body is JSON-encoded.
    pub fn from_script(response: &Value) -> Result<Self, GatewayError> {
        let object = response
            .as_object()
            .ok_or_else(|| GatewayError::Internal("response is not an object".into()))?;

        let status = match object.get("statusCode") {
            None | Some(Value::Null) => 200,
            Some(code) => code
                .as_u64()
                .filter(|c| (100..=999).contains(c))
                .map(|c| c as u16)
                .ok_or_else(|| GatewayError::Internal(format!("invalid statusCode {code}")))?,
        };

        let mut headers = Vec::new();
        if let Some(Value::Object(map)) = object.get("headers") {
            for (name, value) in map {
                match value {
                    Value::Array(values) => {
                        headers.extend(values.iter().map(|v| (name.clone(), header_text(v))))
                    }
                    Value::Null => {}
                    other => headers.push((name.clone(), header_text(other))),
                }
            }
        }

        let body = match object.get("body") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(text)) => text.clone().into_bytes(),
            Some(other) => {
                if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                    headers.push(("Content-Type".into(), "application/json".into()));
                }
                other.to_string().into_bytes()
            }
        };

        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn header_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_object_shape() {
        let request = InboundRequest::new("POST", "/widgets/7")
            .with_query("x=1&x=2&y=%20z")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_header("Accept", "a")
            .with_header("Accept", "b")
            .with_body("name=w&x=1");
        let query = request.query_pairs();
        let vars = BTreeMap::from([("id".to_string(), "7".to_string())]);
        let obj = request.script_object("req-1", &query, &vars);

        assert_eq!(obj["__type"], "http");
        assert_eq!(obj["id"], "req-1");
        assert_eq!(obj["uri"], "/widgets/7?x=1&x=2&y=%20z");
        assert_eq!(obj["query"]["x"], json!(["1", "2"]));
        assert_eq!(obj["query"]["y"], " z");
        assert_eq!(obj["headers"]["Accept"], json!(["a", "b"]));
        assert_eq!(obj["form"]["name"], "w");
        assert_eq!(obj["vars"]["id"], "7");
        assert_eq!(obj["params"]["x"], json!(["1", "2"]));
        assert_eq!(obj["params"]["id"], "7");
        assert_eq!(obj["contentLength"], 10);
    }

    #[test]
    fn form_only_for_form_bodies() {
        let request = InboundRequest::new("POST", "/").with_body("a=1");
        let obj = request.script_object("r", &[], &BTreeMap::new());
        assert_eq!(obj["form"], json!({}));
        assert_eq!(obj["body"], "a=1");
    }

    #[test]
    fn response_from_script() {
        let wire = WireResponse::from_script(&json!({
            "statusCode": 201,
            "headers": { "X-One": "1", "X-Many": ["a", "b"], "X-Num": 5 },
            "body": "hello"
        }))
        .unwrap();
        assert_eq!(wire.status, 201);
        assert_eq!(wire.text(), "hello");
        assert_eq!(wire.header("x-num"), Some("5"));
        assert_eq!(
            wire.headers.iter().filter(|(k, _)| k == "X-Many").count(),
            2
        );
    }

    #[test]
    fn non_string_body_is_json_encoded() {
        let wire = WireResponse::from_script(&json!({ "body": { "a": 1 } })).unwrap();
        assert_eq!(wire.status, 200);
        assert_eq!(wire.text(), r#"{"a":1}"#);
        assert_eq!(wire.header("content-type"), Some("application/json"));
    }

    #[test]
    fn rejects_bad_responses() {
        assert!(WireResponse::from_script(&json!(null)).is_err());
        assert!(WireResponse::from_script(&json!({ "statusCode": 42 })).is_err());
        assert!(WireResponse::from_script(&json!({ "statusCode": "200" })).is_err());
    }
}
