//! Directory driver on ldap3.
//!
//! Endpoint data: `host`, `port` (default 389), `use_tls` (StartTLS) or a
//! full `url`, plus optional `username`/`password` the connection binds
//! with before running the operation. Every call opens its own connection.
//! Results carry the LDAP result code as `statusCode`.

mod memory;

use std::collections::HashSet;
use std::time::Duration;

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapResult, Mod, Scope, SearchEntry, SearchOptions};
use serde_json::{json, Map, Value};
use switchyard_error::CallError;

use crate::descriptor::{scalar_text, LdapOp, LdapScope};
use crate::{BackendRequest, Driver};

use memory::MemoryDirectories;

const SUCCESS: u16 = 0;
const SIZE_LIMIT_EXCEEDED: u16 = 4;
const COMPARE_FALSE: u16 = 5;
const COMPARE_TRUE: u16 = 6;
const NO_SUCH_ATTRIBUTE: u16 = 16;
const NO_SUCH_OBJECT: u16 = 32;
const INVALID_CREDENTIALS: u16 = 49;
const NOT_ALLOWED_ON_NON_LEAF: u16 = 66;
const ENTRY_ALREADY_EXISTS: u16 = 68;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn describe(code: u16) -> &'static str {
    match code {
        SUCCESS => "Success",
        SIZE_LIMIT_EXCEEDED => "Size Limit Exceeded",
        COMPARE_FALSE => "Compare False",
        COMPARE_TRUE => "Compare True",
        NO_SUCH_ATTRIBUTE => "No Such Attribute",
        NO_SUCH_OBJECT => "No Such Object",
        INVALID_CREDENTIALS => "Invalid Credentials",
        NOT_ALLOWED_ON_NON_LEAF => "Not Allowed On Non Leaf",
        ENTRY_ALREADY_EXISTS => "Entry Already Exists",
        _ => "Other",
    }
}

fn status(code: u16) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("statusCode".into(), Value::from(code));
    out.insert("statusDescription".into(), Value::from(describe(code)));
    out
}

fn value_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(scalar_text).collect(),
        Value::Null => Vec::new(),
        other => vec![scalar_text(other)],
    }
}

fn err(e: impl std::fmt::Display) -> CallError {
    CallError::upstream("ldap", e.to_string())
}

fn result_code(result: &LdapResult) -> u16 {
    u16::try_from(result.rc).unwrap_or(u16::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DirectoryServer {
    url: String,
    starttls: bool,
    credentials: Option<(String, String)>,
}

impl DirectoryServer {
    fn from_connection(connection: &Value) -> Self {
        let cfg = connection.get("config").unwrap_or(connection);
        let text = |k: &str| {
            cfg.get(k)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        let starttls = cfg.get("use_tls").and_then(Value::as_bool).unwrap_or(false);
        let url = text("url").unwrap_or_else(|| {
            let port = cfg.get("port").and_then(Value::as_u64).unwrap_or(389);
            format!(
                "ldap://{}:{port}",
                text("host").unwrap_or_else(|| "localhost".to_string())
            )
        });
        let credentials = match (text("username"), text("password")) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        };
        Self {
            url,
            starttls,
            credentials,
        }
    }

    async fn connect(&self) -> Result<Ldap, CallError> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(CONNECT_TIMEOUT)
            .set_starttls(self.starttls);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.url)
            .await
            .map_err(err)?;
        let url = self.url.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::warn!(url = %url, error = %e, "ldap connection ended with an error");
            }
        });
        if let Some((user, password)) = &self.credentials {
            let bound = ldap.simple_bind(user, password).await.map_err(err)?;
            if bound.rc != 0 {
                let _ = ldap.unbind().await;
                return Err(CallError::upstream(
                    "ldap",
                    format!("invalid credentials for {user}"),
                ));
            }
        }
        Ok(ldap)
    }
}

fn value_set(value: &Value) -> HashSet<String> {
    value_list(value).into_iter().collect()
}

fn modifications(
    add: &Map<String, Value>,
    delete: &Map<String, Value>,
    replace: &Map<String, Value>,
) -> Vec<Mod<String>> {
    let mut mods = Vec::new();
    for (name, value) in add {
        mods.push(Mod::Add(name.clone(), value_set(value)));
    }
    for (name, value) in delete {
        mods.push(Mod::Delete(name.clone(), value_set(value)));
    }
    for (name, value) in replace {
        mods.push(Mod::Replace(name.clone(), value_set(value)));
    }
    mods
}

fn entry_json(entry: SearchEntry) -> Value {
    let attributes: Map<String, Value> = entry
        .attrs
        .into_iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("userPassword"))
        .map(|(name, values)| (name, json!(values)))
        .collect();
    json!({ "distinguishedName": entry.dn, "attributes": attributes })
}

async fn run(ldap: &mut Ldap, op: LdapOp) -> Result<Value, CallError> {
    let out = match op {
        LdapOp::Bind { username, password } => {
            let result = ldap.simple_bind(&username, &password).await.map_err(err)?;
            status(result_code(&result))
        }
        LdapOp::Search {
            base_dn,
            scope,
            filter,
            attributes,
            size_limit,
        } => {
            let scope = match scope {
                LdapScope::Base => Scope::Base,
                LdapScope::One => Scope::OneLevel,
                LdapScope::Sub => Scope::Subtree,
            };
            let limit = i32::try_from(size_limit).unwrap_or(i32::MAX);
            let found = ldap
                .with_search_options(SearchOptions::new().sizelimit(limit))
                .search(&base_dn, scope, &filter, attributes)
                .await
                .map_err(err)?;
            let results: Vec<Value> = found
                .0
                .into_iter()
                .map(|raw| entry_json(SearchEntry::construct(raw)))
                .collect();
            let mut out = status(result_code(&found.1));
            out.insert("searchResults".into(), Value::Array(results));
            out
        }
        LdapOp::Add { dn, attributes } => {
            let attrs: Vec<(String, HashSet<String>)> = attributes
                .iter()
                .map(|(name, value)| (name.clone(), value_set(value)))
                .collect();
            status(result_code(&ldap.add(&dn, attrs).await.map_err(err)?))
        }
        LdapOp::Modify {
            dn,
            add,
            delete,
            replace,
        } => {
            let mods = modifications(&add, &delete, &replace);
            status(result_code(&ldap.modify(&dn, mods).await.map_err(err)?))
        }
        LdapOp::Delete { dn } => status(result_code(&ldap.delete(&dn).await.map_err(err)?)),
        LdapOp::Compare {
            dn,
            attribute,
            value,
        } => {
            let compared = ldap
                .compare(&dn, &attribute, value.as_bytes())
                .await
                .map_err(err)?;
            match result_code(&compared.0) {
                code @ (COMPARE_TRUE | COMPARE_FALSE) => {
                    let mut out = status(SUCCESS);
                    out.insert(
                        "compareResult".into(),
                        json!({ "matches": code == COMPARE_TRUE }),
                    );
                    out
                }
                code => status(code),
            }
        }
    };
    Ok(Value::Object(out))
}

enum Mode {
    Network,
    InMemory(MemoryDirectories),
}

/// LDAP driver.
pub struct LdapDriver {
    mode: Mode,
}

impl LdapDriver {
    /// A driver that talks to directory servers.
    pub fn new() -> Self {
        Self {
            mode: Mode::Network,
        }
    }

    /// A driver backed by in-process directories seeded from each
    /// endpoint's `entries`.
    pub fn in_memory() -> Self {
        Self {
            mode: Mode::InMemory(MemoryDirectories::default()),
        }
    }
}

impl Default for LdapDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Driver for LdapDriver {
    async fn execute(&self, request: BackendRequest, connection: &Value) -> Result<Value, CallError> {
        let op = match request {
            BackendRequest::Ldap(op) => op,
            other => {
                return Err(CallError::invalid(
                    "ldap",
                    format!("cannot execute a {} request", other.kind()),
                ))
            }
        };
        match &self.mode {
            Mode::InMemory(directories) => directories.execute(op, connection),
            Mode::Network => {
                let server = DirectoryServer::from_connection(connection);
                let mut ldap = server.connect().await?;
                let out = run(&mut ldap, op).await;
                if let Err(e) = ldap.unbind().await {
                    tracing::debug!(url = %server.url, error = %e, "ldap unbind failed");
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_model::BackendKind;

    #[test]
    fn server_is_read_from_the_endpoint() {
        let server = DirectoryServer::from_connection(&json!({
            "host": "dir.corp", "port": 1389, "use_tls": true,
            "username": "cn=admin,dc=corp", "password": "pw"
        }));
        assert_eq!(server.url, "ldap://dir.corp:1389");
        assert!(server.starttls);
        assert_eq!(
            server.credentials,
            Some(("cn=admin,dc=corp".to_string(), "pw".to_string()))
        );

        let server = DirectoryServer::from_connection(&json!({"config": {"host": "dir.corp"}}));
        assert_eq!(server.url, "ldap://dir.corp:389");
        assert!(!server.starttls);
        assert_eq!(server.credentials, None);

        let server = DirectoryServer::from_connection(&json!({"url": "ldaps://dir.corp:636"}));
        assert_eq!(server.url, "ldaps://dir.corp:636");
    }

    #[test]
    fn modifications_keep_their_kind() {
        let add = json!({"mail": ["a@x.test", "b@x.test"]});
        let delete = json!({"phone": null});
        let replace = json!({"cn": "Ada"});
        let mods = modifications(
            add.as_object().unwrap(),
            delete.as_object().unwrap(),
            replace.as_object().unwrap(),
        );
        assert_eq!(mods.len(), 3);
        assert!(matches!(&mods[0], Mod::Add(name, values) if name == "mail" && values.len() == 2));
        assert!(matches!(&mods[1], Mod::Delete(name, values) if name == "phone" && values.is_empty()));
        assert!(matches!(&mods[2], Mod::Replace(name, values) if name == "cn" && values.contains("Ada")));
    }

    #[test]
    fn status_carries_a_description() {
        let out = status(NO_SUCH_OBJECT);
        assert_eq!(out["statusCode"], 32);
        assert_eq!(out["statusDescription"], "No Such Object");
        assert_eq!(status(80)["statusDescription"], "Other");
    }

    #[tokio::test]
    async fn unreachable_server_is_an_upstream_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let req = BackendRequest::parse(
            BackendKind::Ldap,
            &json!({"operationName": "delete", "arguments": {"distinguishedName": "uid=x"}}),
        )
        .unwrap();
        let err = LdapDriver::new()
            .execute(req, &json!({"host": "127.0.0.1", "port": port}))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Upstream { ref backend, .. } if backend == "ldap"));
    }
}
