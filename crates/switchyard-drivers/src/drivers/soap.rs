//! SOAP driver: POSTs a SOAP 1.1 envelope over the HTTP driver's stack.

use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::{Map, Value};
use switchyard_error::CallError;

use super::http::{build_headers, into_response};
use crate::descriptor::{flatten_pairs, scalar_text, SoapRequest};
use crate::{BackendRequest, Driver};

const ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// Calls SOAP services.
pub struct SoapDriver {
    client: Client,
}

impl SoapDriver {
    /// Create a SOAP driver with its own HTTP client.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
        })
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn valid_element_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn write_element(out: &mut String, name: &str, value: &Value) -> Result<(), CallError> {
    if !valid_element_name(name) {
        return Err(CallError::invalid(
            "soap",
            format!("invalid parameter name '{name}'"),
        ));
    }
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(out, name, item)?;
            }
        }
        Value::Object(fields) => {
            out.push_str(&format!("<{name}>"));
            write_fields(out, fields)?;
            out.push_str(&format!("</{name}>"));
        }
        Value::Null => out.push_str(&format!("<{name}/>")),
        scalar => out.push_str(&format!(
            "<{name}>{}</{name}>",
            escape_xml(&scalar_text(scalar))
        )),
    }
    Ok(())
}

fn write_fields(out: &mut String, fields: &Map<String, Value>) -> Result<(), CallError> {
    for (name, value) in fields {
        write_element(out, name, value)?;
    }
    Ok(())
}

/// Build an envelope wrapping one operation element.
pub(crate) fn envelope(req: &SoapRequest) -> Result<String, CallError> {
    let operation = req.operation_name.as_deref().unwrap_or_default();
    if !valid_element_name(operation) {
        return Err(CallError::invalid(
            "soap",
            format!("invalid operation name '{operation}'"),
        ));
    }
    let mut body = String::new();
    write_fields(&mut body, &req.params)?;
    let (open, close) = match &req.namespace {
        Some(ns) => (
            format!("<m:{operation} xmlns:m=\"{}\">", escape_xml(ns)),
            format!("</m:{operation}>"),
        ),
        None => (format!("<{operation}>"), format!("</{operation}>")),
    };
    Ok(format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <soap:Envelope xmlns:soap=\"{ENVELOPE_NS}\"><soap:Body>{open}{body}{close}</soap:Body></soap:Envelope>"
    ))
}

#[async_trait::async_trait]
impl Driver for SoapDriver {
    async fn execute(&self, request: BackendRequest, connection: &Value) -> Result<Value, CallError> {
        let req = match request {
            BackendRequest::Soap(req) => req,
            other => {
                return Err(CallError::invalid(
                    "soap",
                    format!("cannot execute a {} request", other.kind()),
                ))
            }
        };
        let url = req
            .url
            .clone()
            .or_else(|| connection.get("url").and_then(Value::as_str).map(String::from))
            .ok_or_else(|| CallError::invalid("soap", "url is required"))?;
        let payload = match &req.body {
            Some(body) => body.clone(),
            None => envelope(&req)?,
        };

        let mut headers = build_headers("soap", flatten_pairs(&req.headers))?;
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/xml; charset=utf-8"),
        );
        let action = req.action_name.clone().unwrap_or_default();
        let action = HeaderValue::from_str(&format!("\"{action}\""))
            .map_err(|_| CallError::invalid("soap", "invalid actionName"))?;
        headers.insert(HeaderName::from_static("soapaction"), action);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(payload)
            .send()
            .await
            .map_err(|e| CallError::upstream("soap", format!("request failed: {}", e.without_url())))?;
        into_response("soap", resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(params: Value) -> SoapRequest {
        SoapRequest {
            url: None,
            action_name: Some("urn:GetQuote".into()),
            operation_name: Some("GetQuote".into()),
            namespace: Some("urn:quotes".into()),
            params: params.as_object().cloned().unwrap_or_default(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    #[test]
    fn envelope_nests_and_escapes_params() {
        let xml = envelope(&request(serde_json::json!({
            "symbol": "A&B <co>",
            "range": {"from": 1, "to": 2},
            "tag": ["x", "y"]
        })))
        .unwrap();
        assert!(xml.contains("<m:GetQuote xmlns:m=\"urn:quotes\">"));
        assert!(xml.contains("<symbol>A&amp;B &lt;co&gt;</symbol>"));
        assert!(xml.contains("<range><from>1</from><to>2</to></range>"));
        assert!(xml.contains("<tag>x</tag><tag>y</tag>"));
        assert!(xml.ends_with("</m:GetQuote></soap:Body></soap:Envelope>"));
    }

    #[test]
    fn envelope_rejects_bad_element_names() {
        let err = envelope(&request(serde_json::json!({"bad name": 1}))).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }
}
