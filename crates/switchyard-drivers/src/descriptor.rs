//! Normalized, validated backend requests.
//!
//! Script builds loosely-typed descriptors; they are parsed here into a
//! closed [`BackendRequest`] before any driver sees them. A descriptor that
//! does not parse becomes an [`CallError::InvalidDescriptor`] for its own call
//! slot only.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use switchyard_error::CallError;
use switchyard_model::BackendKind;

/// A typed backend request.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendRequest {
    /// HTTP call.
    Http(HttpRequest),
    /// SOAP call.
    Soap(SoapRequest),
    /// Relational query or statement.
    Sql(SqlRequest),
    /// Document store operation.
    Store(StoreOp),
    /// Directory operation.
    Ldap(LdapOp),
    /// Cache command.
    Redis(RedisCommand),
    /// Outbound mail.
    Smtp(MailMessage),
    /// Container command.
    Docker(ContainerRun),
    /// Job run or schedule.
    Job(JobRequest),
    /// Key management operation.
    Key(KeyOp),
    /// Push operation.
    Push(PushOp),
}

impl BackendRequest {
    /// Parse a script-built descriptor for the given backend.
    pub fn parse(kind: BackendKind, descriptor: &Value) -> Result<Self, CallError> {
        let tag = kind.as_str();
        if !descriptor.is_object() {
            return Err(CallError::invalid(tag, "descriptor must be an object"));
        }
        match kind {
            BackendKind::Http => Ok(Self::Http(HttpRequest::parse(descriptor)?)),
            BackendKind::Soap => Ok(Self::Soap(SoapRequest::parse(descriptor)?)),
            k if k.is_sql() => Ok(Self::Sql(SqlRequest::parse(k, descriptor)?)),
            BackendKind::Store => Ok(Self::Store(StoreOp::parse(descriptor)?)),
            BackendKind::Ldap => Ok(Self::Ldap(LdapOp::parse(descriptor)?)),
            BackendKind::Redis => Ok(Self::Redis(RedisCommand::parse(descriptor)?)),
            BackendKind::Smtp => Ok(Self::Smtp(MailMessage::parse(descriptor)?)),
            BackendKind::Docker => Ok(Self::Docker(ContainerRun::parse(descriptor)?)),
            BackendKind::Job => Ok(Self::Job(JobRequest::parse(descriptor)?)),
            BackendKind::Key => Ok(Self::Key(KeyOp::parse(descriptor)?)),
            BackendKind::Push => Ok(Self::Push(PushOp::parse(descriptor)?)),
            other => Err(CallError::BackendNotRegistered(other.as_str().to_string())),
        }
    }

    /// Backend kind this request targets.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Http(_) => BackendKind::Http,
            Self::Soap(_) => BackendKind::Soap,
            Self::Sql(r) => r.dialect,
            Self::Store(_) => BackendKind::Store,
            Self::Ldap(_) => BackendKind::Ldap,
            Self::Redis(_) => BackendKind::Redis,
            Self::Smtp(_) => BackendKind::Smtp,
            Self::Docker(_) => BackendKind::Docker,
            Self::Job(_) => BackendKind::Job,
            Self::Key(_) => BackendKind::Key,
            Self::Push(_) => BackendKind::Push,
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(tag: &str, value: &Value) -> Result<T, CallError> {
    serde_json::from_value(value.clone()).map_err(|e| CallError::invalid(tag, e.to_string()))
}

fn required(tag: &str, field: &str, value: Option<String>) -> Result<String, CallError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(CallError::invalid(tag, format!("{field} is required"))),
    }
}

/// Render a JSON scalar as a header, query or form value.
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flatten a header/query map whose values may be strings or arrays.
pub(crate) fn flatten_pairs(map: &BTreeMap<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (name, value) in map {
        match value {
            Value::Array(items) => {
                pairs.extend(items.iter().map(|v| (name.clone(), scalar_text(v))));
            }
            other => pairs.push((name.clone(), scalar_text(other))),
        }
    }
    pairs
}

// --- http ---

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    /// HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
    /// Target URL; falls back to the remote endpoint's `url`.
    #[serde(default)]
    pub url: Option<String>,
    /// Query parameters merged over the endpoint's.
    #[serde(default)]
    pub query: BTreeMap<String, Value>,
    /// Headers merged over the endpoint's.
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    /// Request body. Non-string bodies are sent as JSON.
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequest {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let mut req: HttpRequest = decode("http", value)?;
        req.method = req.method.trim().to_ascii_uppercase();
        if req.method.is_empty() || !req.method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(CallError::invalid(
                "http",
                format!("invalid method '{}'", req.method),
            ));
        }
        Ok(req)
    }
}

// --- soap ---

/// A SOAP call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoapRequest {
    /// Service URL; falls back to the remote endpoint's `url`.
    #[serde(default)]
    pub url: Option<String>,
    /// `SOAPAction` header value.
    #[serde(default)]
    pub action_name: Option<String>,
    /// Operation element name for a generated envelope.
    #[serde(default)]
    pub operation_name: Option<String>,
    /// Operation namespace for a generated envelope.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Operation parameters for a generated envelope.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Extra HTTP headers.
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    /// A complete envelope, sent as is.
    #[serde(default)]
    pub body: Option<String>,
}

impl SoapRequest {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let req: SoapRequest = decode("soap", value)?;
        if req.body.is_none() && req.operation_name.as_deref().unwrap_or("").is_empty() {
            return Err(CallError::invalid(
                "soap",
                "either body or operationName is required",
            ));
        }
        Ok(req)
    }
}

// --- sql ---

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Int(i64),
    /// Double.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Text; arrays and objects bind as their JSON text.
    Text(String),
}

/// Result column coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Integer.
    Int64,
    /// Double.
    Float64,
    /// Boolean.
    Bool,
    /// String.
    String,
    /// Parse text as JSON.
    Json,
}

impl ColumnType {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int" | "int64" | "integer" => Some(Self::Int64),
            "float" | "float64" | "double" => Some(Self::Float64),
            "bool" | "boolean" => Some(Self::Bool),
            "string" | "text" => Some(Self::String),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Coerce a column value.
    pub fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (Self::Int64, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::String(s)),
            (Self::Int64, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::from)
                .unwrap_or(Value::Number(n)),
            (Self::Int64, Value::Bool(b)) => Value::from(i64::from(b)),
            (Self::Float64, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .unwrap_or(Value::String(s)),
            (Self::Float64, Value::Number(n)) => {
                n.as_f64().map(Value::from).unwrap_or(Value::Number(n))
            }
            (Self::Bool, Value::Number(n)) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
            (Self::Bool, Value::String(s)) => {
                let t = s.trim().to_ascii_lowercase();
                Value::Bool(matches!(t.as_str(), "1" | "t" | "true" | "y" | "yes"))
            }
            (Self::String, Value::String(s)) => Value::String(s),
            (Self::String, other) => Value::String(other.to_string()),
            (Self::Json, Value::String(s)) => {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            }
            (_, other) => other,
        }
    }
}

/// Whether the request reads rows or changes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlStatement {
    /// Returns rows as `data`.
    Query(String),
    /// Returns `rowsAffected` and `insertId`.
    Execute(String),
}

/// A relational request.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRequest {
    /// Target dialect.
    pub dialect: BackendKind,
    /// The statement.
    pub statement: SqlStatement,
    /// Positional parameters.
    pub parameters: Vec<SqlValue>,
    /// Per-column coercions.
    pub result_types: BTreeMap<String, ColumnType>,
    /// Run inside a transaction.
    pub transactional: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSql {
    #[serde(default)]
    query_statement: Option<String>,
    #[serde(default)]
    execute_statement: Option<String>,
    #[serde(default)]
    parameters: Vec<Value>,
    #[serde(default)]
    result_types: BTreeMap<String, String>,
    #[serde(default)]
    transactions: bool,
}

impl SqlRequest {
    fn parse(dialect: BackendKind, value: &Value) -> Result<Self, CallError> {
        let tag = dialect.as_str();
        let raw: RawSql = decode(tag, value)?;
        let query = raw.query_statement.filter(|s| !s.trim().is_empty());
        let execute = raw.execute_statement.filter(|s| !s.trim().is_empty());
        let statement = match (query, execute) {
            (Some(q), None) => SqlStatement::Query(q),
            (None, Some(e)) => SqlStatement::Execute(e),
            (None, None) => {
                return Err(CallError::invalid(
                    tag,
                    "one of queryStatement or executeStatement is required",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(CallError::invalid(
                    tag,
                    "queryStatement and executeStatement are mutually exclusive",
                ))
            }
        };

        let parameters = raw
            .parameters
            .iter()
            .enumerate()
            .map(|(i, p)| {
                sql_parameter(p).map_err(|reason| {
                    CallError::invalid(tag, format!("parameter {i}: {reason}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut result_types = BTreeMap::new();
        for (column, type_name) in raw.result_types {
            let ty = ColumnType::parse(&type_name).ok_or_else(|| {
                CallError::invalid(
                    tag,
                    format!("unknown result type '{type_name}' for column '{column}'"),
                )
            })?;
            result_types.insert(column, ty);
        }

        Ok(Self {
            dialect,
            statement,
            parameters,
            result_types,
            transactional: raw.transactions,
        })
    }
}

fn sql_parameter(value: &Value) -> Result<SqlValue, String> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Bool(*b)),
        Value::Number(n) => Ok(n
            .as_i64()
            .map(SqlValue::Int)
            .unwrap_or_else(|| SqlValue::Float(n.as_f64().unwrap_or_default()))),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Object(obj) if obj.get("_type").and_then(Value::as_str) == Some("Converter") => {
            let target = obj
                .get("convertTo")
                .and_then(Value::as_str)
                .ok_or("converter is missing convertTo")?;
            convert(obj.get("value").unwrap_or(&Value::Null), target)
        }
        other => Ok(SqlValue::Text(other.to_string())),
    }
}

fn convert(value: &Value, target: &str) -> Result<SqlValue, String> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let text = scalar_text(value);
    match target {
        "int64" => match value {
            Value::Number(n) if n.is_i64() => Ok(SqlValue::Int(n.as_i64().unwrap_or_default())),
            Value::Number(n) => Ok(SqlValue::Int(n.as_f64().unwrap_or_default() as i64)),
            Value::Bool(b) => Ok(SqlValue::Int(i64::from(*b))),
            _ => text
                .trim()
                .parse()
                .map(SqlValue::Int)
                .map_err(|_| format!("cannot convert '{text}' to int64")),
        },
        "float64" => match value {
            Value::Number(n) => Ok(SqlValue::Float(n.as_f64().unwrap_or_default())),
            _ => text
                .trim()
                .parse()
                .map(SqlValue::Float)
                .map_err(|_| format!("cannot convert '{text}' to float64")),
        },
        "bool" => match value {
            Value::Bool(b) => Ok(SqlValue::Bool(*b)),
            Value::Number(n) => Ok(SqlValue::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            _ => text
                .trim()
                .parse()
                .map(SqlValue::Bool)
                .map_err(|_| format!("cannot convert '{text}' to bool")),
        },
        "string" => Ok(SqlValue::Text(text)),
        other => Err(format!("unknown conversion target '{other}'")),
    }
}

// --- store ---

/// How a store operation selects documents.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreQuery {
    /// A single document id.
    Id(u64),
    /// Every field must equal the given value.
    Match(Map<String, Value>),
    /// A boolean expression over document fields with `$n` placeholders.
    Expr(String),
}

/// A document store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Insert a document or array of documents.
    Insert {
        /// Collection name.
        collection: String,
        /// Document(s).
        documents: Vec<Value>,
    },
    /// Select documents.
    Select {
        /// Collection name.
        collection: String,
        /// Selector.
        query: StoreQuery,
        /// Placeholder arguments for [`StoreQuery::Expr`].
        params: Vec<Value>,
    },
    /// Replace a document by id.
    Update {
        /// Collection name.
        collection: String,
        /// Document id.
        id: u64,
        /// New content.
        document: Value,
    },
    /// Delete documents.
    Delete {
        /// Collection name.
        collection: String,
        /// Selector.
        query: StoreQuery,
        /// Placeholder arguments for [`StoreQuery::Expr`].
        params: Vec<Value>,
    },
}

impl StoreOp {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let args = value
            .get("arguments")
            .and_then(Value::as_array)
            .ok_or_else(|| CallError::invalid("store", "arguments must be an array"))?;
        let op = args.first().and_then(Value::as_str).unwrap_or("");
        let collection = args
            .get(1)
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CallError::invalid("store", "collection name is required"))?
            .to_string();
        let rest: Vec<Value> = args.iter().skip(2).cloned().collect();

        match op {
            "insert" => {
                let documents = match rest.first() {
                    Some(Value::Array(docs)) => docs.clone(),
                    Some(doc @ Value::Object(_)) => vec![doc.clone()],
                    _ => return Err(CallError::invalid("store", "insert requires an object")),
                };
                if documents.iter().any(|d| !d.is_object()) {
                    return Err(CallError::invalid("store", "documents must be objects"));
                }
                Ok(Self::Insert {
                    collection,
                    documents,
                })
            }
            "select" | "delete" => {
                let query = store_query(rest.first())?;
                let params = rest.iter().skip(1).cloned().collect();
                if op == "select" {
                    Ok(Self::Select {
                        collection,
                        query,
                        params,
                    })
                } else {
                    Ok(Self::Delete {
                        collection,
                        query,
                        params,
                    })
                }
            }
            "update" => {
                let id = rest
                    .first()
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CallError::invalid("store", "update requires a document id"))?;
                let document = rest
                    .get(1)
                    .filter(|d| d.is_object())
                    .cloned()
                    .ok_or_else(|| CallError::invalid("store", "update requires an object"))?;
                Ok(Self::Update {
                    collection,
                    id,
                    document,
                })
            }
            other => Err(CallError::invalid(
                "store",
                format!("unknown operation '{other}'"),
            )),
        }
    }
}

fn store_query(value: Option<&Value>) -> Result<StoreQuery, CallError> {
    match value {
        None | Some(Value::Null) => Ok(StoreQuery::Match(Map::new())),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(StoreQuery::Id)
            .ok_or_else(|| CallError::invalid("store", "document id must be a positive integer")),
        Some(Value::Object(m)) => Ok(StoreQuery::Match(m.clone())),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(StoreQuery::Match(Map::new())),
        Some(Value::String(s)) => Ok(StoreQuery::Expr(s.clone())),
        Some(_) => Err(CallError::invalid("store", "unsupported query type")),
    }
}

// --- ldap ---

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdapScope {
    /// The base entry only.
    Base,
    /// Immediate children of the base.
    One,
    /// The base and all descendants.
    Sub,
}

impl LdapScope {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" | "baseobject" => Some(Self::Base),
            "one" | "single" | "singlelevel" | "onelevel" => Some(Self::One),
            "sub" | "subtree" | "wholesubtree" => Some(Self::Sub),
            _ => None,
        }
    }
}

/// A directory operation.
#[derive(Debug, Clone, PartialEq)]
pub enum LdapOp {
    /// Authenticate a DN.
    Bind {
        /// DN to bind as.
        username: String,
        /// Password.
        password: String,
    },
    /// Search entries.
    Search {
        /// Search base.
        base_dn: String,
        /// Scope.
        scope: LdapScope,
        /// RFC 4515 filter.
        filter: String,
        /// Attributes to return; empty means all.
        attributes: Vec<String>,
        /// Maximum entries; 0 means unlimited.
        size_limit: usize,
    },
    /// Add an entry.
    Add {
        /// New DN.
        dn: String,
        /// Attribute map.
        attributes: Map<String, Value>,
    },
    /// Modify an entry.
    Modify {
        /// Target DN.
        dn: String,
        /// Values appended per attribute.
        add: Map<String, Value>,
        /// Attributes (or specific values) removed.
        delete: Map<String, Value>,
        /// Attributes replaced.
        replace: Map<String, Value>,
    },
    /// Delete an entry.
    Delete {
        /// Target DN.
        dn: String,
    },
    /// Compare an attribute value.
    Compare {
        /// Target DN.
        dn: String,
        /// Attribute name.
        attribute: String,
        /// Asserted value.
        value: String,
    },
}

impl LdapOp {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let op = value
            .get("operationName")
            .and_then(Value::as_str)
            .unwrap_or("");
        let args = value.get("arguments").cloned().unwrap_or(Value::Null);
        let text = |field: &str| -> Option<String> {
            args.get(field).and_then(Value::as_str).map(String::from)
        };
        let object = |field: &str| -> Map<String, Value> {
            args.get(field)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };

        match op {
            "bind" => Ok(Self::Bind {
                username: required("ldap", "username", text("username"))?,
                password: text("password").unwrap_or_default(),
            }),
            "search" => {
                let scope_name = text("scope").unwrap_or_else(|| "sub".to_string());
                let scope = LdapScope::parse(&scope_name).ok_or_else(|| {
                    CallError::invalid("ldap", format!("unknown search scope '{scope_name}'"))
                })?;
                let attributes = args
                    .get("attributes")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
                    .unwrap_or_default();
                Ok(Self::Search {
                    base_dn: text("baseDistinguishedName").unwrap_or_default(),
                    scope,
                    filter: text("filter")
                        .filter(|f| !f.trim().is_empty())
                        .unwrap_or_else(|| "(objectClass=*)".to_string()),
                    attributes,
                    size_limit: args.get("sizeLimit").and_then(Value::as_u64).unwrap_or(0)
                        as usize,
                })
            }
            "add" => Ok(Self::Add {
                dn: required("ldap", "distinguishedName", text("distinguishedName"))?,
                attributes: object("attributes"),
            }),
            "modify" => Ok(Self::Modify {
                dn: required("ldap", "distinguishedName", text("distinguishedName"))?,
                add: object("addAttributes"),
                delete: object("deleteAttributes"),
                replace: object("replaceAttributes"),
            }),
            "delete" => Ok(Self::Delete {
                dn: required("ldap", "distinguishedName", text("distinguishedName"))?,
            }),
            "compare" => Ok(Self::Compare {
                dn: required("ldap", "distinguishedName", text("distinguishedName"))?,
                attribute: required("ldap", "attribute", text("attribute"))?,
                value: args.get("value").map(scalar_text).unwrap_or_default(),
            }),
            other => Err(CallError::invalid(
                "ldap",
                format!("unknown operation '{other}'"),
            )),
        }
    }
}

// --- redis ---

/// A tokenized cache command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisCommand {
    /// Upper-cased command name.
    pub name: String,
    /// Arguments.
    pub args: Vec<String>,
}

const REDIS_COMMANDS: &[&str] = &["GET", "SET", "DEL", "EXISTS", "INCR", "EXPIRE", "TTL"];

impl RedisCommand {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let stmt = value
            .get("executeStatement")
            .and_then(Value::as_str)
            .unwrap_or("");
        let mut tokens = tokenize(stmt).map_err(|e| CallError::invalid("redis", e))?;
        if tokens.is_empty() {
            return Err(CallError::invalid("redis", "executeStatement is required"));
        }
        let name = tokens.remove(0).to_ascii_uppercase();
        if !REDIS_COMMANDS.contains(&name.as_str()) {
            return Err(CallError::invalid(
                "redis",
                format!("unsupported command '{name}'"),
            ));
        }
        Ok(Self { name, args: tokens })
    }
}

/// Split on whitespace, honouring single and double quotes.
fn tokenize(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;
    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

// --- smtp ---

/// An outbound mail message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Recipients.
    pub to: Vec<String>,
    /// Sender; falls back to the endpoint's `from`.
    pub from: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// Send as `text/html`.
    pub html: bool,
}

#[derive(Deserialize)]
struct RawMail {
    #[serde(default)]
    to: Value,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html: bool,
}

impl MailMessage {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let raw: RawMail = decode("smtp", value)?;
        let mut to: Vec<String> = match raw.to {
            Value::String(s) => vec![s],
            Value::Array(items) => items.iter().filter_map(Value::as_str).map(String::from).collect(),
            _ => Vec::new(),
        };
        if let Some(address) = raw.address {
            to.push(address);
        }
        if to.is_empty() {
            return Err(CallError::invalid("smtp", "at least one recipient is required"));
        }
        if let Some(bad) = to.iter().chain(raw.from.as_ref()).find(|a| !is_address(a)) {
            return Err(CallError::invalid("smtp", format!("invalid address '{bad}'")));
        }
        Ok(Self {
            to,
            from: raw.from,
            subject: raw.subject,
            body: raw.body.unwrap_or_default(),
            html: raw.html,
        })
    }
}

fn is_address(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !s.contains(|c: char| c.is_whitespace() || c == '<' || c == '>' || c == '\r' || c == '\n')
        }
        None => false,
    }
}

// --- docker ---

/// A container command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRun {
    /// Image; falls back to the endpoint's `image`.
    #[serde(default)]
    pub image: Option<String>,
    /// Command to run.
    #[serde(default)]
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ContainerRun {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let run: ContainerRun = decode("docker", value)?;
        if run.command.trim().is_empty() {
            return Err(CallError::invalid("docker", "command is required"));
        }
        Ok(run)
    }
}

// --- job ---

/// When a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTiming {
    /// Run now and wait for the result.
    Now,
    /// Run at the given time; the call returns immediately.
    At(DateTime<Utc>),
}

/// A job request naming another proxy endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Proxy endpoint name.
    pub name: String,
    /// Attributes passed as the job's request body.
    pub attributes: Map<String, Value>,
    /// When to run.
    pub timing: JobTiming,
}

impl JobRequest {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let name = required(
            "job",
            "name",
            value.get("name").and_then(Value::as_str).map(String::from),
        )?;
        let attributes = value
            .get("attributes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let timing = match value.get("operation").and_then(Value::as_str) {
            Some("run") | None => JobTiming::Now,
            Some("schedule") => JobTiming::At(parse_time(value.get("time"))?),
            Some(other) => {
                return Err(CallError::invalid(
                    "job",
                    format!("unknown operation '{other}'"),
                ))
            }
        };
        Ok(Self {
            name,
            attributes,
            timing,
        })
    }
}

fn parse_time(value: Option<&Value>) -> Result<DateTime<Utc>, CallError> {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| CallError::invalid("job", "invalid unix time")),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CallError::invalid("job", format!("invalid time '{s}': {e}"))),
        _ => Err(CallError::invalid("job", "schedule requires a time")),
    }
}

// --- key ---

/// A key management operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOp {
    /// Create a named key, generating a secret when none is given.
    Create {
        /// Key name.
        name: String,
        /// Base64 secret.
        secret: Option<String>,
    },
    /// Delete a named key.
    Delete {
        /// Key name.
        name: String,
    },
    /// List key names.
    List,
    /// Sign data with a named key.
    Sign {
        /// Key name.
        name: String,
        /// Data to sign.
        data: String,
    },
    /// Verify a signature.
    Verify {
        /// Key name.
        name: String,
        /// Signed data.
        data: String,
        /// Base64 signature.
        signature: String,
    },
}

impl KeyOp {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let text = |field: &str| value.get(field).and_then(Value::as_str).map(String::from);
        match value.get("operation").and_then(Value::as_str).unwrap_or("") {
            "create" => Ok(Self::Create {
                name: required("key", "name", text("name"))?,
                secret: text("secret"),
            }),
            "delete" => Ok(Self::Delete {
                name: required("key", "name", text("name"))?,
            }),
            "list" => Ok(Self::List),
            "sign" => Ok(Self::Sign {
                name: required("key", "name", text("name"))?,
                data: value.get("data").map(scalar_text).unwrap_or_default(),
            }),
            "verify" => Ok(Self::Verify {
                name: required("key", "name", text("name"))?,
                data: value.get("data").map(scalar_text).unwrap_or_default(),
                signature: required("key", "signature", text("signature"))?,
            }),
            other => Err(CallError::invalid("key", format!("unknown operation '{other}'"))),
        }
    }
}

// --- push ---

/// A push operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOp {
    /// Deliver a payload to every subscriber of a channel.
    Push {
        /// Channel name.
        channel: String,
        /// Payload.
        payload: Value,
    },
    /// Subscribe a device.
    Subscribe {
        /// Device platform.
        platform: String,
        /// Channel name.
        channel: String,
        /// Device token.
        token: String,
    },
    /// Unsubscribe a device.
    Unsubscribe {
        /// Device platform.
        platform: String,
        /// Channel name.
        channel: String,
        /// Device token.
        token: String,
    },
}

impl PushOp {
    fn parse(value: &Value) -> Result<Self, CallError> {
        let text = |field: &str| value.get(field).and_then(Value::as_str).map(String::from);
        let channel = required("push", "channel", text("channel"))?;
        match value.get("operation").and_then(Value::as_str).unwrap_or("push") {
            "push" => Ok(Self::Push {
                channel,
                payload: value.get("payload").cloned().unwrap_or(Value::Null),
            }),
            op @ ("subscribe" | "unsubscribe") => {
                let platform = required("push", "platform", text("platform"))?;
                let token = required("push", "token", text("token"))?;
                if op == "subscribe" {
                    Ok(Self::Subscribe {
                        platform,
                        channel,
                        token,
                    })
                } else {
                    Ok(Self::Unsubscribe {
                        platform,
                        channel,
                        token,
                    })
                }
            }
            other => Err(CallError::invalid("push", format!("unknown operation '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code(err: CallError) -> &'static str {
        err.code()
    }

    #[test]
    fn http_defaults_and_normalizes_method() {
        let req = BackendRequest::parse(BackendKind::Http, &json!({"method": "post", "url": "http://x"}))
            .unwrap();
        match req {
            BackendRequest::Http(h) => {
                assert_eq!(h.method, "POST");
                assert_eq!(h.url.as_deref(), Some("http://x"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        let get = HttpRequest::parse(&json!({})).unwrap();
        assert_eq!(get.method, "GET");
    }

    #[test]
    fn http_rejects_bad_method() {
        let err = HttpRequest::parse(&json!({"method": "GE T"})).unwrap_err();
        assert_eq!(code(err), "INVALID_REQUEST");
    }

    #[test]
    fn non_object_descriptor_is_invalid() {
        let err = BackendRequest::parse(BackendKind::Http, &json!("nope")).unwrap_err();
        assert!(err.to_string().contains("must be an object"));
    }

    #[test]
    fn sql_requires_exactly_one_statement() {
        assert!(SqlRequest::parse(BackendKind::Postgres, &json!({})).is_err());
        assert!(SqlRequest::parse(
            BackendKind::Postgres,
            &json!({"queryStatement": "a", "executeStatement": "b"})
        )
        .is_err());
        let ok = SqlRequest::parse(
            BackendKind::Postgres,
            &json!({"queryStatement": "SELECT 1", "executeStatement": ""}),
        )
        .unwrap();
        assert_eq!(ok.statement, SqlStatement::Query("SELECT 1".into()));
    }

    #[test]
    fn sql_converters_are_applied() {
        let req = SqlRequest::parse(
            BackendKind::MySql,
            &json!({
                "executeStatement": "UPDATE t SET a = ?, b = ?, c = ?",
                "parameters": [
                    {"_type": "Converter", "value": "42", "convertTo": "int64"},
                    {"_type": "Converter", "value": 1, "convertTo": "bool"},
                    {"_type": "Converter", "value": 2.5, "convertTo": "string"}
                ]
            }),
        )
        .unwrap();
        assert_eq!(
            req.parameters,
            vec![SqlValue::Int(42), SqlValue::Bool(true), SqlValue::Text("2.5".into())]
        );
    }

    #[test]
    fn sql_bad_converter_names_the_parameter() {
        let err = SqlRequest::parse(
            BackendKind::Sqlite,
            &json!({
                "queryStatement": "SELECT ?",
                "parameters": [{"_type": "Converter", "value": "x", "convertTo": "int64"}]
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("parameter 0"), "{err}");
    }

    #[test]
    fn sql_unknown_result_type_rejected() {
        let err = SqlRequest::parse(
            BackendKind::Sqlite,
            &json!({"queryStatement": "SELECT 1", "resultTypes": {"a": "decimal"}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("decimal"));
    }

    #[test]
    fn column_coercion() {
        assert_eq!(ColumnType::Int64.coerce(json!("12")), json!(12));
        assert_eq!(ColumnType::Bool.coerce(json!(0)), json!(false));
        assert_eq!(ColumnType::Json.coerce(json!("{\"a\":1}")), json!({"a": 1}));
        assert_eq!(ColumnType::String.coerce(json!(3)), json!("3"));
        assert_eq!(ColumnType::Float64.coerce(Value::Null), Value::Null);
    }

    #[test]
    fn store_operations_parse() {
        let op = StoreOp::parse(&json!({"arguments": ["select", "users", "age > $1", 30]})).unwrap();
        assert_eq!(
            op,
            StoreOp::Select {
                collection: "users".into(),
                query: StoreQuery::Expr("age > $1".into()),
                params: vec![json!(30)],
            }
        );
        let op = StoreOp::parse(&json!({"arguments": ["delete", "users", 4]})).unwrap();
        assert!(matches!(op, StoreOp::Delete { query: StoreQuery::Id(4), .. }));
        assert!(StoreOp::parse(&json!({"arguments": ["drop", "users"]})).is_err());
        assert!(StoreOp::parse(&json!({"arguments": ["insert", "users", 5]})).is_err());
    }

    #[test]
    fn ldap_scope_aliases_and_rejection() {
        let op = LdapOp::parse(&json!({
            "operationName": "search",
            "arguments": {"baseDistinguishedName": "dc=x", "scope": "single"}
        }))
        .unwrap();
        assert!(matches!(op, LdapOp::Search { scope: LdapScope::One, .. }));

        let err = LdapOp::parse(&json!({
            "operationName": "search",
            "arguments": {"scope": "sideways"}
        }))
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn redis_statement_tokenizes_quotes() {
        let cmd = RedisCommand::parse(&json!({"executeStatement": "set greeting 'hello world' EX 10"}))
            .unwrap();
        assert_eq!(cmd.name, "SET");
        assert_eq!(cmd.args, vec!["greeting", "hello world", "EX", "10"]);
        assert!(RedisCommand::parse(&json!({"executeStatement": "FLUSHALL"})).is_err());
        assert!(RedisCommand::parse(&json!({"executeStatement": "GET 'open"})).is_err());
    }

    #[test]
    fn smtp_validates_recipients() {
        let msg = MailMessage::parse(&json!({"to": "a@example.com", "subject": "hi"})).unwrap();
        assert_eq!(msg.to, vec!["a@example.com"]);
        assert!(MailMessage::parse(&json!({"to": []})).is_err());
        assert!(MailMessage::parse(&json!({"to": "bad\r\nRCPT TO:<x@y>"})).is_err());
    }

    #[test]
    fn smtp_validates_sender() {
        let msg = MailMessage::parse(&json!({"to": "a@example.com", "from": "gw@example.com"})).unwrap();
        assert_eq!(msg.from.as_deref(), Some("gw@example.com"));
        let err = MailMessage::parse(&json!({
            "to": "a@example.com",
            "from": "gw@example.com>\r\nRCPT TO:<victim@example.org"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("invalid address"));
        assert!(MailMessage::parse(&json!({"to": "a@example.com", "from": "nobody"})).is_err());
    }

    #[test]
    fn job_schedule_requires_time() {
        assert!(JobRequest::parse(&json!({"operation": "schedule", "name": "x"})).is_err());
        let job = JobRequest::parse(&json!({
            "operation": "schedule", "name": "x", "time": "2030-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(matches!(job.timing, JobTiming::At(_)));
    }

    #[test]
    fn push_subscribe_requires_token() {
        assert!(PushOp::parse(&json!({"operation": "subscribe", "channel": "c", "platform": "ios"}))
            .is_err());
        assert!(PushOp::parse(&json!({"channel": "c", "payload": {"a": 1}})).is_ok());
    }
}
