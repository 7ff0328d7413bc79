//! JSON document store.
//!
//! Collections live in memory, grouped by the endpoint's `database` name.
//! Every document carries a numeric `id` assigned on insert.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde_json::{json, Map, Value};
use switchyard_error::CallError;

use crate::descriptor::{StoreOp, StoreQuery};
use crate::{BackendRequest, Driver};

#[derive(Default)]
struct Collection {
    next_id: u64,
    documents: BTreeMap<u64, Map<String, Value>>,
}

/// In-memory document store driver.
#[derive(Default)]
pub struct StoreDriver {
    databases: RwLock<HashMap<String, HashMap<String, Collection>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    field: String,
    op: Cmp,
    value: Value,
}

/// Parse `field op $n [and field op $n ...]`.
fn parse_expr(expr: &str, params: &[Value]) -> Result<Vec<Clause>, String> {
    let mut clauses = Vec::new();
    for part in split_and(expr) {
        let part = part.trim();
        let (field, op, rest) = ["!=", ">=", "<=", "=", ">", "<"]
            .iter()
            .find_map(|token| {
                part.split_once(token).map(|(l, r)| {
                    let op = match *token {
                        "!=" => Cmp::Ne,
                        ">=" => Cmp::Ge,
                        "<=" => Cmp::Le,
                        "=" => Cmp::Eq,
                        ">" => Cmp::Gt,
                        _ => Cmp::Lt,
                    };
                    (l.trim(), op, r.trim())
                })
            })
            .ok_or_else(|| format!("cannot parse clause '{part}'"))?;
        if field.is_empty() {
            return Err(format!("missing field in clause '{part}'"));
        }
        let value = match rest.strip_prefix('$') {
            Some(n) => {
                let index: usize = n
                    .parse()
                    .map_err(|_| format!("bad placeholder '{rest}'"))?;
                params
                    .get(index.wrapping_sub(1))
                    .cloned()
                    .ok_or_else(|| format!("no argument for placeholder '{rest}'"))?
            }
            None => serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string())),
        };
        clauses.push(Clause {
            field: field.to_string(),
            op,
            value,
        });
    }
    Ok(clauses)
}

fn split_and(expr: &str) -> Vec<&str> {
    let lower = expr.to_ascii_lowercase();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(pos) = lower[search..].find(" and ") {
        let at = search + pos;
        parts.push(&expr[start..at]);
        start = at + 5;
        search = start;
    }
    parts.push(&expr[start..]);
    parts
}

fn compare(left: &Value, op: Cmp, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        Cmp::Eq => left == right,
        Cmp::Ne => left != right,
        Cmp::Gt => ordering.is_some_and(|o| o.is_gt()),
        Cmp::Lt => ordering.is_some_and(|o| o.is_lt()),
        Cmp::Ge => ordering.is_some_and(|o| o.is_ge()),
        Cmp::Le => ordering.is_some_and(|o| o.is_le()),
    }
}

enum Selector {
    Id(u64),
    Match(Map<String, Value>),
    Clauses(Vec<Clause>),
}

impl Selector {
    fn new(query: StoreQuery, params: &[Value]) -> Result<Self, CallError> {
        Ok(match query {
            StoreQuery::Id(id) => Self::Id(id),
            StoreQuery::Match(m) => Self::Match(m),
            StoreQuery::Expr(e) => {
                Self::Clauses(parse_expr(&e, params).map_err(|r| CallError::invalid("store", r))?)
            }
        })
    }

    fn matches(&self, id: u64, doc: &Map<String, Value>) -> bool {
        match self {
            Self::Id(want) => *want == id,
            Self::Match(fields) => fields.iter().all(|(k, v)| doc.get(k) == Some(v)),
            Self::Clauses(clauses) => clauses.iter().all(|c| {
                doc.get(&c.field)
                    .is_some_and(|v| compare(v, c.op, &c.value))
            }),
        }
    }
}

impl StoreDriver {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, database: &str, op: StoreOp) -> Result<Value, CallError> {
        let mut databases = self.databases.write().unwrap_or_else(|e| e.into_inner());
        let collections = databases.entry(database.to_string()).or_default();
        match op {
            StoreOp::Insert {
                collection,
                documents,
            } => {
                let coll = collections.entry(collection).or_default();
                let mut inserted = Vec::with_capacity(documents.len());
                for doc in documents {
                    let Value::Object(mut doc) = doc else {
                        continue;
                    };
                    coll.next_id += 1;
                    let id = coll.next_id;
                    doc.insert("id".to_string(), Value::from(id));
                    coll.documents.insert(id, doc.clone());
                    inserted.push(Value::Object(doc));
                }
                Ok(json!({ "data": inserted }))
            }
            StoreOp::Select {
                collection,
                query,
                params,
            } => {
                let selector = Selector::new(query, &params)?;
                let data: Vec<Value> = collections
                    .get(&collection)
                    .map(|c| {
                        c.documents
                            .iter()
                            .filter(|(id, doc)| selector.matches(**id, doc))
                            .map(|(_, doc)| Value::Object(doc.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(json!({ "data": data }))
            }
            StoreOp::Update {
                collection,
                id,
                document,
            } => {
                let coll = collections.entry(collection.clone()).or_default();
                let Some(slot) = coll.documents.get_mut(&id) else {
                    return Err(CallError::upstream(
                        "store",
                        format!("no document {id} in '{collection}'"),
                    ));
                };
                let mut doc = document.as_object().cloned().unwrap_or_default();
                doc.insert("id".to_string(), Value::from(id));
                *slot = doc.clone();
                Ok(json!({ "data": doc }))
            }
            StoreOp::Delete {
                collection,
                query,
                params,
            } => {
                let selector = Selector::new(query, &params)?;
                let removed = match collections.get_mut(&collection) {
                    Some(coll) => {
                        let before = coll.documents.len();
                        coll.documents.retain(|id, doc| !selector.matches(*id, doc));
                        before - coll.documents.len()
                    }
                    None => 0,
                };
                Ok(json!({ "data": { "deleted": removed } }))
            }
        }
    }
}

#[async_trait::async_trait]
impl Driver for StoreDriver {
    async fn execute(&self, request: BackendRequest, connection: &Value) -> Result<Value, CallError> {
        let op = match request {
            BackendRequest::Store(op) => op,
            other => {
                return Err(CallError::invalid(
                    "store",
                    format!("cannot execute a {} request", other.kind()),
                ))
            }
        };
        let database = connection
            .get("database")
            .and_then(Value::as_str)
            .unwrap_or("default");
        self.apply(database, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_model::BackendKind;

    async fn run(driver: &StoreDriver, args: Value) -> Result<Value, CallError> {
        let req = BackendRequest::parse(BackendKind::Store, &json!({ "arguments": args }))?;
        driver.execute(req, &json!({})).await
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_select_filters() {
        let store = StoreDriver::new();
        let out = run(
            &store,
            json!(["insert", "widgets", [{"name": "a", "size": 1}, {"name": "b", "size": 5}]]),
        )
        .await
        .unwrap();
        assert_eq!(out["data"][0]["id"], 1);
        assert_eq!(out["data"][1]["id"], 2);

        let big = run(&store, json!(["select", "widgets", "size >= $1", 3]))
            .await
            .unwrap();
        assert_eq!(big["data"], json!([{"name": "b", "size": 5, "id": 2}]));

        let by_id = run(&store, json!(["select", "widgets", 1])).await.unwrap();
        assert_eq!(by_id["data"][0]["name"], "a");

        let by_match = run(&store, json!(["select", "widgets", {"name": "b"}]))
            .await
            .unwrap();
        assert_eq!(by_match["data"][0]["id"], 2);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let store = StoreDriver::new();
        run(&store, json!(["insert", "w", {"n": 1}])).await.unwrap();
        run(&store, json!(["insert", "w", {"n": 2}])).await.unwrap();

        let updated = run(&store, json!(["update", "w", 1, {"n": 10}])).await.unwrap();
        assert_eq!(updated["data"], json!({"n": 10, "id": 1}));

        let missing = run(&store, json!(["update", "w", 9, {"n": 0}])).await.unwrap_err();
        assert_eq!(missing.code(), "UPSTREAM_ERROR");

        let deleted = run(&store, json!(["delete", "w", "n = $1 and id = $2", 10, 1]))
            .await
            .unwrap();
        assert_eq!(deleted["data"]["deleted"], 1);
        let rest = run(&store, json!(["select", "w"])).await.unwrap();
        assert_eq!(rest["data"], json!([{"n": 2, "id": 2}]));
    }

    #[tokio::test]
    async fn missing_placeholder_argument_is_invalid() {
        let store = StoreDriver::new();
        let err = run(&store, json!(["select", "w", "n = $2", 1])).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn expression_parsing() {
        let clauses = parse_expr("a != $1 AND b < 3", &[json!("x")]).unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].op, Cmp::Ne);
        assert_eq!(clauses[1].value, json!(3));
        assert!(parse_expr("nonsense", &[]).is_err());
    }
}
