//! Session store: per-cookie key/value state reachable from script.
//!
//! The [`SessionStore`] is shared by every request. A [`SessionHandle`] binds
//! one request to at most one session id. A request without a session id
//! only gets one when script first writes; until then reads see an empty
//! session and nothing is stored.
//!
//! Writes go straight to the store, so concurrent requests on the same id
//! see each other's committed writes and the last write to a key wins.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key validation regex: printable identifiers, 1–256 chars.
static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-.:/]{1,256}$").expect("static regex is valid"));

/// Limits for the session store.
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// Maximum keys per session (default: 256).
    pub max_keys_per_session: usize,
    /// Maximum size of one JSON-serialised value in bytes (default: 1 MiB).
    pub max_value_size: usize,
    /// Sessions untouched for this long are evicted (default: 30 days).
    pub idle_ttl: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            max_keys_per_session: 256,
            max_value_size: 1024 * 1024,
            idle_ttl: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Cookie options script can set through `session.setOptions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieOptions {
    /// `Max-Age`. Zero or absent leaves the environment default, negative
    /// expires the cookie and destroys the session.
    #[serde(default)]
    pub max_age: Option<i64>,
    /// `Path`.
    #[serde(default)]
    pub path: Option<String>,
    /// `Domain`.
    #[serde(default)]
    pub domain: Option<String>,
    /// `Secure`.
    #[serde(default)]
    pub secure: Option<bool>,
    /// `HttpOnly`.
    #[serde(default)]
    pub http_only: Option<bool>,
}

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session already holds the maximum number of keys.
    #[error("session key limit exceeded (max {max} keys)")]
    KeyLimitExceeded {
        /// Configured maximum.
        max: usize,
    },
    /// The serialised value exceeds the per-value size limit.
    #[error("session value too large ({size} bytes, max {max} bytes)")]
    ValueTooLarge {
        /// Actual size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The key is empty, too long or contains invalid characters.
    #[error("invalid session key")]
    InvalidKey,
}

struct SessionRecord {
    values: HashMap<String, Value>,
    options: Option<CookieOptions>,
    touched: Instant,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            options: None,
            touched: Instant::now(),
        }
    }
}

/// Shared, concurrency-safe session storage.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    config: SessionStoreConfig,
}

fn validate_key(key: &str) -> Result<(), SessionError> {
    if KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err(SessionError::InvalidKey)
    }
}

impl SessionStore {
    /// Create a store with the given limits.
    pub fn new(config: SessionStoreConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Read a value. `None` when the session or key does not exist.
    pub fn get(&self, session_id: &str, key: &str) -> Option<Value> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let record = sessions.get(session_id)?;
        if record.touched.elapsed() >= self.config.idle_ttl {
            return None;
        }
        record.values.get(key).cloned()
    }

    /// Store a value, creating the session if needed.
    pub fn set(&self, session_id: &str, key: &str, value: Value) -> Result<(), SessionError> {
        validate_key(key)?;
        let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        if size > self.config.max_value_size {
            return Err(SessionError::ValueTooLarge {
                size,
                max: self.config.max_value_size,
            });
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let idle_ttl = self.config.idle_ttl;
        sessions.retain(|_, r| r.touched.elapsed() < idle_ttl);

        let record = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionRecord::new);
        if !record.values.contains_key(key)
            && record.values.len() >= self.config.max_keys_per_session
        {
            return Err(SessionError::KeyLimitExceeded {
                max: self.config.max_keys_per_session,
            });
        }
        record.values.insert(key.to_string(), value);
        record.touched = Instant::now();
        Ok(())
    }

    /// Whether the key holds a value.
    pub fn is_set(&self, session_id: &str, key: &str) -> bool {
        self.get(session_id, key).is_some()
    }

    /// Remove a key. Returns whether it existed.
    pub fn delete(&self, session_id: &str, key: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(session_id) {
            Some(record) => {
                record.touched = Instant::now();
                record.values.remove(key).is_some()
            }
            None => false,
        }
    }

    /// Record cookie options for the session, creating it if needed.
    pub fn set_options(&self, session_id: &str, options: CookieOptions) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let record = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionRecord::new);
        record.options = Some(options);
        record.touched = Instant::now();
    }

    /// Cookie options previously recorded for the session.
    pub fn options(&self, session_id: &str) -> Option<CookieOptions> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).and_then(|r| r.options.clone())
    }

    /// Whether a live session with this id exists.
    pub fn exists(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .is_some_and(|r| r.touched.elapsed() < self.config.idle_ttl)
    }

    /// Drop a session and all its values.
    pub fn destroy(&self, session_id: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id);
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .filter(|r| r.touched.elapsed() < self.config.idle_ttl)
            .count()
    }

    /// Whether the store holds no live sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionStoreConfig::default())
    }
}

/// One request's view of its session.
///
/// Created by the gateway from the verified cookie (or none) and moved into
/// the sandbox for the request's duration. Handed back afterwards so the
/// gateway knows whether to emit or expire the cookie.
pub struct SessionHandle {
    store: Arc<SessionStore>,
    id: Option<String>,
    minted: bool,
    options: Option<CookieOptions>,
    destroyed: bool,
}

impl SessionHandle {
    /// Bind a request to `id`, or to no session yet when `None`.
    pub fn new(store: Arc<SessionStore>, id: Option<String>) -> Self {
        Self {
            store,
            id,
            minted: false,
            options: None,
            destroyed: false,
        }
    }

    /// Session id, if the request has one.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Whether the id was created during this request.
    pub fn minted(&self) -> bool {
        self.minted
    }

    /// Whether script expired the session during this request.
    pub fn destroyed(&self) -> bool {
        self.destroyed
    }

    /// Cookie options set during this request.
    pub fn options(&self) -> Option<&CookieOptions> {
        self.options.as_ref()
    }

    /// Read a value.
    pub fn get(&self, key: &str) -> Option<Value> {
        let id = self.id.as_deref()?;
        self.store.get(id, key)
    }

    /// Whether the key holds a value.
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Store a value, minting a session id on first write.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        let id = self.ensure_id();
        self.store.set(&id, key, value)?;
        self.destroyed = false;
        Ok(())
    }

    /// Remove a key.
    pub fn delete(&mut self, key: &str) -> bool {
        match self.id.as_deref() {
            Some(id) => self.store.delete(id, key),
            None => false,
        }
    }

    /// Apply cookie options. A negative `maxAge` destroys the session.
    pub fn set_options(&mut self, options: CookieOptions) {
        let id = self.ensure_id();
        if options.max_age.is_some_and(|age| age < 0) {
            self.store.destroy(&id);
            self.destroyed = true;
        } else {
            self.store.set_options(&id, options.clone());
        }
        self.options = Some(options);
    }

    /// Whether the response should carry a session cookie.
    pub fn needs_cookie(&self) -> bool {
        self.destroyed || self.options.is_some() || (self.minted && self.id.is_some())
    }

    fn ensure_id(&mut self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                self.id = Some(id.clone());
                self.minted = true;
                id
            }
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("minted", &self.minted)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::default())
    }

    #[test]
    fn set_get_roundtrip() {
        let s = store();
        s.set("a", "num", json!(1)).unwrap();
        assert_eq!(s.get("a", "num"), Some(json!(1)));
        assert!(s.is_set("a", "num"));
        assert!(!s.is_set("a", "other"));
    }

    #[test]
    fn sessions_are_isolated_by_id() {
        let s = store();
        s.set("a", "num", json!(1)).unwrap();
        assert_eq!(s.get("b", "num"), None);
        assert!(!s.is_set("b", "num"));
    }

    #[test]
    fn last_write_wins() {
        let s = store();
        s.set("a", "k", json!("first")).unwrap();
        s.set("a", "k", json!("second")).unwrap();
        assert_eq!(s.get("a", "k"), Some(json!("second")));
    }

    #[test]
    fn delete_removes_key_only() {
        let s = store();
        s.set("a", "x", json!(1)).unwrap();
        s.set("a", "y", json!(2)).unwrap();
        assert!(s.delete("a", "x"));
        assert!(!s.delete("a", "x"));
        assert_eq!(s.get("a", "y"), Some(json!(2)));
    }

    #[test]
    fn structured_values_are_stored() {
        let s = store();
        s.set("a", "user", json!({"name": "ada", "roles": ["admin"]}))
            .unwrap();
        assert_eq!(s.get("a", "user").unwrap()["roles"][0], "admin");
    }

    #[test]
    fn rejects_invalid_keys() {
        let s = store();
        assert!(matches!(
            s.set("a", "", json!(1)),
            Err(SessionError::InvalidKey)
        ));
        assert!(matches!(
            s.set("a", "has space", json!(1)),
            Err(SessionError::InvalidKey)
        ));
        let long = "k".repeat(257);
        assert!(s.set("a", &long, json!(1)).is_err());
    }

    #[test]
    fn enforces_key_limit() {
        let s = Arc::new(SessionStore::new(SessionStoreConfig {
            max_keys_per_session: 2,
            ..Default::default()
        }));
        s.set("a", "k1", json!(1)).unwrap();
        s.set("a", "k2", json!(2)).unwrap();
        assert!(matches!(
            s.set("a", "k3", json!(3)),
            Err(SessionError::KeyLimitExceeded { max: 2 })
        ));
        // Overwriting an existing key is still allowed
        s.set("a", "k1", json!(10)).unwrap();
    }

    #[test]
    fn enforces_value_size() {
        let s = Arc::new(SessionStore::new(SessionStoreConfig {
            max_value_size: 8,
            ..Default::default()
        }));
        assert!(matches!(
            s.set("a", "k", json!("a long string value")),
            Err(SessionError::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn idle_sessions_expire() {
        let s = Arc::new(SessionStore::new(SessionStoreConfig {
            idle_ttl: Duration::from_millis(20),
            ..Default::default()
        }));
        s.set("a", "k", json!(1)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(s.get("a", "k"), None);
        assert!(!s.exists("a"));
        assert!(s.is_empty());
    }

    #[test]
    fn handle_without_id_reads_empty_and_mints_on_write() {
        let s = store();
        let mut h = SessionHandle::new(s.clone(), None);
        assert_eq!(h.get("num"), None);
        assert!(!h.delete("num"));
        assert!(h.id().is_none());
        assert!(!h.needs_cookie());
        assert!(s.is_empty());

        h.set("num", json!(1)).unwrap();
        let id = h.id().unwrap().to_string();
        assert!(h.minted());
        assert!(h.needs_cookie());
        assert_eq!(s.get(&id, "num"), Some(json!(1)));
    }

    #[test]
    fn handle_with_existing_id_does_not_mint() {
        let s = store();
        s.set("known", "num", json!(4)).unwrap();
        let mut h = SessionHandle::new(s.clone(), Some("known".into()));
        assert_eq!(h.get("num"), Some(json!(4)));
        h.set("num", json!(5)).unwrap();
        assert!(!h.minted());
        assert!(!h.needs_cookie());
        assert_eq!(s.get("known", "num"), Some(json!(5)));
    }

    #[test]
    fn negative_max_age_destroys_session() {
        let s = store();
        s.set("known", "num", json!(1)).unwrap();
        let mut h = SessionHandle::new(s.clone(), Some("known".into()));
        h.set_options(CookieOptions {
            max_age: Some(-1),
            ..Default::default()
        });
        assert!(h.destroyed());
        assert!(h.needs_cookie());
        assert!(!s.exists("known"));
    }

    #[test]
    fn options_are_recorded() {
        let s = store();
        let mut h = SessionHandle::new(s.clone(), Some("known".into()));
        let opts: CookieOptions =
            serde_json::from_value(json!({"maxAge": 60, "path": "/api", "httpOnly": false}))
                .unwrap();
        h.set_options(opts.clone());
        assert_eq!(h.options(), Some(&opts));
        assert_eq!(s.options("known"), Some(opts));
    }
}
