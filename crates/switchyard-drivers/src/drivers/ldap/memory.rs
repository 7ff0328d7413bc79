//! In-process directory, one tree per endpoint `directory`, seeded from the
//! endpoint's `entries`. Used in tests and local development in place of a
//! directory server.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde_json::{json, Map, Value};
use switchyard_error::CallError;

use super::{
    status, value_list, ENTRY_ALREADY_EXISTS, INVALID_CREDENTIALS, NOT_ALLOWED_ON_NON_LEAF,
    NO_SUCH_ATTRIBUTE, NO_SUCH_OBJECT, SIZE_LIMIT_EXCEEDED, SUCCESS,
};
use crate::descriptor::{LdapOp, LdapScope};

/// Normalize a DN for comparison.
fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_ascii_lowercase())
        .filter(|rdn| !rdn.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn parent(dn: &str) -> &str {
    dn.split_once(',').map(|(_, p)| p).unwrap_or("")
}

#[derive(Debug, Clone, Default)]
struct Entry {
    dn: String,
    /// Keyed by lowercased attribute name; holds the original name and values.
    attributes: BTreeMap<String, (String, Vec<String>)>,
}

impl Entry {
    fn values(&self, attr: &str) -> Option<&[String]> {
        self.attributes
            .get(&attr.to_ascii_lowercase())
            .map(|(_, v)| v.as_slice())
    }

    fn add(&mut self, attr: &str, values: Vec<String>) {
        let slot = self
            .attributes
            .entry(attr.to_ascii_lowercase())
            .or_insert_with(|| (attr.to_string(), Vec::new()));
        slot.1.extend(values);
    }

    fn to_json(&self, wanted: &[String]) -> Value {
        let mut attrs = Map::new();
        for (key, (name, values)) in &self.attributes {
            if key == "userpassword" {
                continue;
            }
            if wanted.is_empty() || wanted.iter().any(|w| w.eq_ignore_ascii_case(key)) {
                attrs.insert(name.clone(), json!(values));
            }
        }
        json!({ "distinguishedName": self.dn, "attributes": attrs })
    }
}

// --- filters ---

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
}

struct FilterParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> FilterParser<'a> {
    fn parse(input: &'a str) -> Result<Filter, String> {
        let trimmed = input.trim();
        let wrapped;
        let input = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({trimmed})");
            wrapped.as_str()
        };
        let mut parser = FilterParser { input, pos: 0 };
        let filter = parser.filter()?;
        if parser.pos != parser.input.len() {
            return Err(format!("trailing input in filter '{}'", parser.input));
        }
        Ok(filter)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<(), String> {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(format!("expected '{c}' at offset {} in filter", self.pos))
        }
    }

    fn filter(&mut self) -> Result<Filter, String> {
        self.expect('(')?;
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            _ => self.item()?,
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>, String> {
        let mut items = Vec::new();
        while self.peek() == Some('(') {
            items.push(self.filter()?);
        }
        if items.is_empty() {
            return Err("empty filter list".to_string());
        }
        Ok(items)
    }

    fn item(&mut self) -> Result<Filter, String> {
        let rest = &self.input[self.pos..];
        let end = rest.find(')').ok_or("unterminated filter item")?;
        let item = &rest[..end];
        self.pos += end;

        let (attr, op, value) = if let Some((a, v)) = item.split_once(">=") {
            (a, ">=", v)
        } else if let Some((a, v)) = item.split_once("<=") {
            (a, "<=", v)
        } else if let Some((a, v)) = item.split_once("~=") {
            (a, "=", v)
        } else if let Some((a, v)) = item.split_once('=') {
            (a, "=", v)
        } else {
            return Err(format!("no operator in filter item '{item}'"));
        };
        let attr = attr.trim().to_string();
        if attr.is_empty() {
            return Err(format!("missing attribute in filter item '{item}'"));
        }
        Ok(match op {
            ">=" => Filter::GreaterOrEqual(attr, value.to_string()),
            "<=" => Filter::LessOrEqual(attr, value.to_string()),
            _ if value == "*" => Filter::Present(attr),
            _ if value.contains('*') => {
                let parts: Vec<&str> = value.split('*').collect();
                let initial = Some(parts[0]).filter(|s| !s.is_empty()).map(String::from);
                let last = parts
                    .last()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string());
                let any = parts[1..parts.len() - 1]
                    .iter()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();
                Filter::Substring {
                    attr,
                    initial,
                    any,
                    last,
                }
            }
            _ => Filter::Equal(attr, value.to_string()),
        })
    }
}

fn substring_match(value: &str, initial: &Option<String>, any: &[String], last: &Option<String>) -> bool {
    let value = value.to_lowercase();
    let mut rest = value.as_str();
    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        match rest.strip_prefix(initial.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(last.to_lowercase().as_str()),
        None => true,
    }
}

fn ordered(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.to_lowercase().cmp(&b.to_lowercase()),
    }
}

fn any_value(entry: &Entry, attr: &str, pred: impl Fn(&str) -> bool) -> bool {
    entry
        .values(attr)
        .is_some_and(|vals| vals.iter().any(|v| pred(v)))
}

impl Filter {
    fn matches(&self, entry: &Entry) -> bool {
        match self {
            Self::And(items) => items.iter().all(|f| f.matches(entry)),
            Self::Or(items) => items.iter().any(|f| f.matches(entry)),
            Self::Not(inner) => !inner.matches(entry),
            Self::Present(attr) => {
                attr.eq_ignore_ascii_case("objectclass") || entry.values(attr).is_some()
            }
            Self::Equal(attr, want) => any_value(entry, attr, |v| v.eq_ignore_ascii_case(want)),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => any_value(entry, attr, |v| substring_match(v, initial, any, last)),
            Self::GreaterOrEqual(attr, want) => any_value(entry, attr, |v| ordered(v, want).is_ge()),
            Self::LessOrEqual(attr, want) => any_value(entry, attr, |v| ordered(v, want).is_le()),
        }
    }
}

// --- directory ---

#[derive(Default)]
struct Directory {
    /// Keyed by normalized DN.
    entries: BTreeMap<String, Entry>,
}

impl Directory {
    fn seeded(connection: &Value) -> Self {
        let mut dir = Self::default();
        for seed in connection
            .get("entries")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(dn) = seed.get("dn").and_then(Value::as_str) else {
                continue;
            };
            let mut entry = Entry {
                dn: dn.to_string(),
                ..Entry::default()
            };
            if let Some(attrs) = seed.get("attributes").and_then(Value::as_object) {
                for (name, value) in attrs {
                    entry.add(name, value_list(value));
                }
            }
            dir.entries.insert(normalize_dn(dn), entry);
        }
        dir
    }

    fn apply(&mut self, op: LdapOp) -> Result<Value, CallError> {
        Ok(match op {
            LdapOp::Bind { username, password } => {
                let ok = self
                    .entries
                    .get(&normalize_dn(&username))
                    .and_then(|e| e.values("userPassword"))
                    .is_some_and(|vals| vals.iter().any(|v| *v == password));
                Value::Object(status(if ok { SUCCESS } else { INVALID_CREDENTIALS }))
            }
            LdapOp::Search {
                base_dn,
                scope,
                filter,
                attributes,
                size_limit,
            } => {
                let filter =
                    FilterParser::parse(&filter).map_err(|r| CallError::invalid("ldap", r))?;
                let base = normalize_dn(&base_dn);
                if !base.is_empty() && !self.entries.contains_key(&base) {
                    return Ok(Value::Object(status(NO_SUCH_OBJECT)));
                }
                let mut results = Vec::new();
                let mut code = SUCCESS;
                for (dn, entry) in &self.entries {
                    let in_scope = match scope {
                        LdapScope::Base => *dn == base,
                        LdapScope::One => parent(dn) == base,
                        LdapScope::Sub => {
                            base.is_empty() || *dn == base || dn.ends_with(&format!(",{base}"))
                        }
                    };
                    if in_scope && filter.matches(entry) {
                        if size_limit > 0 && results.len() == size_limit {
                            code = SIZE_LIMIT_EXCEEDED;
                            break;
                        }
                        results.push(entry.to_json(&attributes));
                    }
                }
                let mut out = status(code);
                out.insert("searchResults".into(), Value::Array(results));
                Value::Object(out)
            }
            LdapOp::Add { dn, attributes } => {
                let key = normalize_dn(&dn);
                if self.entries.contains_key(&key) {
                    return Ok(Value::Object(status(ENTRY_ALREADY_EXISTS)));
                }
                let mut entry = Entry {
                    dn,
                    ..Entry::default()
                };
                for (name, value) in &attributes {
                    entry.add(name, value_list(value));
                }
                self.entries.insert(key, entry);
                Value::Object(status(SUCCESS))
            }
            LdapOp::Modify {
                dn,
                add,
                delete,
                replace,
            } => {
                let Some(entry) = self.entries.get_mut(&normalize_dn(&dn)) else {
                    return Ok(Value::Object(status(NO_SUCH_OBJECT)));
                };
                for (name, value) in &add {
                    entry.add(name, value_list(value));
                }
                for (name, value) in &delete {
                    let key = name.to_ascii_lowercase();
                    let doomed = value_list(value);
                    if doomed.is_empty() {
                        entry.attributes.remove(&key);
                    } else if let Some((_, vals)) = entry.attributes.get_mut(&key) {
                        vals.retain(|v| !doomed.contains(v));
                        if vals.is_empty() {
                            entry.attributes.remove(&key);
                        }
                    }
                }
                for (name, value) in &replace {
                    let key = name.to_ascii_lowercase();
                    let values = value_list(value);
                    if values.is_empty() {
                        entry.attributes.remove(&key);
                    } else {
                        entry.attributes.insert(key, (name.clone(), values));
                    }
                }
                Value::Object(status(SUCCESS))
            }
            LdapOp::Delete { dn } => {
                let key = normalize_dn(&dn);
                if !self.entries.contains_key(&key) {
                    return Ok(Value::Object(status(NO_SUCH_OBJECT)));
                }
                if self.entries.keys().any(|k| parent(k) == key) {
                    return Ok(Value::Object(status(NOT_ALLOWED_ON_NON_LEAF)));
                }
                self.entries.remove(&key);
                Value::Object(status(SUCCESS))
            }
            LdapOp::Compare {
                dn,
                attribute,
                value,
            } => {
                let Some(entry) = self.entries.get(&normalize_dn(&dn)) else {
                    return Ok(Value::Object(status(NO_SUCH_OBJECT)));
                };
                let Some(values) = entry.values(&attribute) else {
                    return Ok(Value::Object(status(NO_SUCH_ATTRIBUTE)));
                };
                let matches = values.iter().any(|v| v.eq_ignore_ascii_case(&value));
                let mut out = status(SUCCESS);
                out.insert("compareResult".into(), json!({ "matches": matches }));
                Value::Object(out)
            }
        })
    }
}

/// Directories keyed by the endpoint's `directory` (or `host`).
#[derive(Default)]
pub(super) struct MemoryDirectories {
    directories: RwLock<HashMap<String, Directory>>,
}

impl MemoryDirectories {
    pub(super) fn execute(&self, op: LdapOp, connection: &Value) -> Result<Value, CallError> {
        let name = connection
            .get("directory")
            .or_else(|| connection.get("host"))
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let mut directories = self.directories.write().unwrap_or_else(|e| e.into_inner());
        let directory = directories
            .entry(name)
            .or_insert_with(|| Directory::seeded(connection));
        directory.apply(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::LdapDriver;
    use crate::{BackendRequest, Driver};
    use switchyard_model::BackendKind;

    fn connection() -> Value {
        json!({
            "directory": "corp",
            "entries": [
                {"dn": "dc=corp", "attributes": {"objectClass": "domain"}},
                {"dn": "ou=people,dc=corp", "attributes": {"objectClass": "organizationalUnit"}},
                {"dn": "uid=ada,ou=people,dc=corp", "attributes": {
                    "cn": "Ada Lovelace", "mail": "ada@corp.test", "age": "36", "userPassword": "engine"}},
                {"dn": "uid=bob,ou=people,dc=corp", "attributes": {
                    "cn": "Bob Builder", "mail": ["bob@corp.test", "b@corp.test"], "age": "52"}}
            ]
        })
    }

    async fn run(driver: &LdapDriver, descriptor: Value) -> Value {
        let req = BackendRequest::parse(BackendKind::Ldap, &descriptor).unwrap();
        driver.execute(req, &connection()).await.unwrap()
    }

    #[test]
    fn filter_grammar() {
        let f = FilterParser::parse("(&(cn=Ada*)(!(age>=40)))").unwrap();
        assert!(matches!(f, Filter::And(ref items) if items.len() == 2));
        assert!(FilterParser::parse("cn=x").is_ok());
        assert!(FilterParser::parse("(&)").is_err());
        assert!(FilterParser::parse("(cn=x").is_err());
    }

    #[tokio::test]
    async fn search_scopes_and_filters() {
        let driver = LdapDriver::in_memory();
        let sub = run(
            &driver,
            json!({"operationName": "search", "arguments": {
                "baseDistinguishedName": "dc=corp", "scope": "subtree", "filter": "(mail=*@corp.test)"}}),
        )
        .await;
        assert_eq!(sub["statusCode"], 0);
        assert_eq!(sub["searchResults"].as_array().unwrap().len(), 2);

        let one = run(
            &driver,
            json!({"operationName": "search", "arguments": {
                "baseDistinguishedName": "dc=corp", "scope": "single"}}),
        )
        .await;
        assert_eq!(one["searchResults"][0]["distinguishedName"], "ou=people,dc=corp");

        let filtered = run(
            &driver,
            json!({"operationName": "search", "arguments": {
                "baseDistinguishedName": "ou=people,dc=corp",
                "filter": "(|(age<=40)(cn=nobody))",
                "attributes": ["cn"]}}),
        )
        .await;
        let results = filtered["searchResults"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["attributes"], json!({"cn": ["Ada Lovelace"]}));
    }

    #[tokio::test]
    async fn bind_checks_password_and_hides_it() {
        let driver = LdapDriver::in_memory();
        let ok = run(
            &driver,
            json!({"operationName": "bind", "arguments": {
                "username": "uid=ada,ou=people,dc=corp", "password": "engine"}}),
        )
        .await;
        assert_eq!(ok["statusCode"], 0);
        let bad = run(
            &driver,
            json!({"operationName": "bind", "arguments": {
                "username": "uid=ada,ou=people,dc=corp", "password": "nope"}}),
        )
        .await;
        assert_eq!(bad["statusCode"], 49);

        let found = run(
            &driver,
            json!({"operationName": "search", "arguments": {
                "baseDistinguishedName": "uid=ada,ou=people,dc=corp", "scope": "base"}}),
        )
        .await;
        assert!(found["searchResults"][0]["attributes"].get("userPassword").is_none());
    }

    #[tokio::test]
    async fn add_modify_compare_delete() {
        let driver = LdapDriver::in_memory();
        let dn = "uid=cy,ou=people,dc=corp";
        let added = run(
            &driver,
            json!({"operationName": "add", "arguments": {
                "distinguishedName": dn, "attributes": {"cn": "Cy", "mail": "cy@corp.test"}}}),
        )
        .await;
        assert_eq!(added["statusCode"], 0);
        let again = run(
            &driver,
            json!({"operationName": "add", "arguments": {"distinguishedName": dn}}),
        )
        .await;
        assert_eq!(again["statusCode"], 68);

        run(
            &driver,
            json!({"operationName": "modify", "arguments": {
                "distinguishedName": dn,
                "replaceAttributes": {"cn": "Cyrus"},
                "deleteAttributes": {"mail": null}}}),
        )
        .await;
        let cmp = run(
            &driver,
            json!({"operationName": "compare", "arguments": {
                "distinguishedName": dn, "attribute": "cn", "value": "cyrus"}}),
        )
        .await;
        assert_eq!(cmp["compareResult"]["matches"], true);
        let gone = run(
            &driver,
            json!({"operationName": "compare", "arguments": {
                "distinguishedName": dn, "attribute": "mail", "value": "x"}}),
        )
        .await;
        assert_eq!(gone["statusCode"], 16);

        let non_leaf = run(
            &driver,
            json!({"operationName": "delete", "arguments": {"distinguishedName": "ou=people,dc=corp"}}),
        )
        .await;
        assert_eq!(non_leaf["statusCode"], 66);
        let deleted = run(
            &driver,
            json!({"operationName": "delete", "arguments": {"distinguishedName": dn}}),
        )
        .await;
        assert_eq!(deleted["statusCode"], 0);
    }
}
