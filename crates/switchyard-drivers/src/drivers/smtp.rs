//! Mail driver on lettre's async SMTP transport.
//!
//! Endpoint data (optionally nested under `config`): `host`, `port`,
//! `username`, `password`, `sender` and `tls` (`none`, `opportunistic`,
//! `required` or `wrapper`; default `opportunistic`). A sent message answers
//! `{"data": {"success": true}}`; a server that refuses or cannot be reached
//! fails the call.

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::{json, Value};
use switchyard_error::CallError;

use crate::descriptor::MailMessage;
use crate::{BackendRequest, Driver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsMode {
    None,
    Opportunistic,
    Required,
    Wrapper,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MailServer {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    sender: Option<String>,
    tls: TlsMode,
}

impl MailServer {
    fn from_connection(connection: &Value) -> Result<Self, CallError> {
        let cfg = connection.get("config").unwrap_or(connection);
        let text = |k: &str| cfg.get(k).and_then(Value::as_str).map(String::from);
        let tls = match text("tls").as_deref() {
            None | Some("opportunistic") => TlsMode::Opportunistic,
            Some("none") => TlsMode::None,
            Some("required") | Some("starttls") => TlsMode::Required,
            Some("wrapper") | Some("implicit") => TlsMode::Wrapper,
            Some(other) => {
                return Err(CallError::invalid(
                    "smtp",
                    format!("unknown tls mode '{other}'"),
                ))
            }
        };
        let default_port = if tls == TlsMode::Wrapper { 465 } else { 25 };
        Ok(Self {
            host: text("host").unwrap_or_else(|| "localhost".to_string()),
            port: cfg
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(default_port),
            username: text("username").filter(|u| !u.is_empty()),
            password: text("password"),
            sender: text("sender").or_else(|| text("from")),
            tls,
        })
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, CallError> {
        let parameters = || {
            TlsParameters::new(self.host.clone())
                .map_err(|e| CallError::invalid("smtp", format!("tls setup for {}: {e}", self.host)))
        };
        let tls = match self.tls {
            TlsMode::None => Tls::None,
            TlsMode::Opportunistic => Tls::Opportunistic(parameters()?),
            TlsMode::Required => Tls::Required(parameters()?),
            TlsMode::Wrapper => Tls::Wrapper(parameters()?),
        };
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(self.host.as_str())
            .port(self.port)
            .tls(tls);
        if let Some(user) = &self.username {
            builder = builder.credentials(Credentials::new(
                user.clone(),
                self.password.clone().unwrap_or_default(),
            ));
        }
        Ok(builder.build())
    }
}

fn mailbox(address: &str) -> Result<Mailbox, CallError> {
    address
        .parse::<Mailbox>()
        .map_err(|e| CallError::invalid("smtp", format!("invalid address '{address}': {e}")))
}

fn compose(message: &MailMessage, sender: Option<&str>) -> Result<Message, CallError> {
    let from = message
        .from
        .as_deref()
        .or(sender)
        .ok_or_else(|| CallError::invalid("smtp", "no sender configured"))?;
    let mut builder = Message::builder()
        .from(mailbox(from)?)
        .subject(message.subject.replace(['\r', '\n'], " "));
    for rcpt in &message.to {
        builder = builder.to(mailbox(rcpt)?);
    }
    let content_type = if message.html {
        ContentType::TEXT_HTML
    } else {
        ContentType::TEXT_PLAIN
    };
    builder
        .header(content_type)
        .body(message.body.clone())
        .map_err(|e| CallError::invalid("smtp", e.to_string()))
}

/// SMTP mail driver.
#[derive(Debug, Default)]
pub struct SmtpDriver;

impl SmtpDriver {
    /// A new driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Driver for SmtpDriver {
    async fn execute(&self, request: BackendRequest, connection: &Value) -> Result<Value, CallError> {
        let message = match request {
            BackendRequest::Smtp(m) => m,
            other => {
                return Err(CallError::invalid(
                    "smtp",
                    format!("cannot execute a {} request", other.kind()),
                ))
            }
        };
        let server = MailServer::from_connection(connection)?;
        let email = compose(&message, server.sender.as_deref())?;
        match server.transport()?.send(email).await {
            Ok(_) => Ok(json!({ "data": { "success": true } })),
            Err(e) => {
                tracing::warn!(host = %server.host, port = server.port, error = %e, "mail delivery failed");
                Err(CallError::upstream(
                    "smtp",
                    format!("delivery via {}:{} failed: {e}", server.host, server.port),
                ))
            }
        }
    }
}
