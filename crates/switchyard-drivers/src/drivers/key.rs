//! Key management driver: named HMAC-SHA256 keys.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use switchyard_error::CallError;

use crate::descriptor::KeyOp;
use crate::{BackendRequest, Driver};

type HmacSha256 = Hmac<Sha256>;

fn fresh_secret() -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.finalize().to_vec()
}

fn mac(secret: &[u8], data: &str) -> Result<HmacSha256, CallError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| CallError::Internal(anyhow::anyhow!("hmac key: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac)
}

/// Named keys, grouped into keyrings by the endpoint's `keyring` field.
#[derive(Default)]
pub struct KeyDriver {
    keyrings: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl KeyDriver {
    /// An empty key store.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, keyring: &str, op: KeyOp) -> Result<Value, CallError> {
        let mut rings = self.keyrings.write().unwrap_or_else(|e| e.into_inner());
        let ring = rings.entry(keyring.to_string()).or_default();
        let lookup = |ring: &BTreeMap<String, Vec<u8>>, name: &str| {
            ring.get(name)
                .cloned()
                .ok_or_else(|| CallError::upstream("key", format!("no key named '{name}'")))
        };
        match op {
            KeyOp::Create { name, secret } => {
                if ring.contains_key(&name) {
                    return Err(CallError::upstream("key", format!("key '{name}' already exists")));
                }
                let secret = match secret {
                    Some(encoded) => STANDARD
                        .decode(encoded.trim())
                        .map_err(|e| CallError::invalid("key", format!("secret is not base64: {e}")))?,
                    None => fresh_secret(),
                };
                if secret.is_empty() {
                    return Err(CallError::invalid("key", "secret must not be empty"));
                }
                ring.insert(name.clone(), secret);
                Ok(json!({ "data": { "name": name } }))
            }
            KeyOp::Delete { name } => {
                let deleted = ring.remove(&name).is_some();
                Ok(json!({ "data": { "name": name, "deleted": deleted } }))
            }
            KeyOp::List => Ok(json!({ "data": ring.keys().collect::<Vec<_>>() })),
            KeyOp::Sign { name, data } => {
                let secret = lookup(ring, &name)?;
                let signature = STANDARD.encode(mac(&secret, &data)?.finalize().into_bytes());
                Ok(json!({ "data": { "signature": signature } }))
            }
            KeyOp::Verify {
                name,
                data,
                signature,
            } => {
                let secret = lookup(ring, &name)?;
                let valid = match STANDARD.decode(signature.trim()) {
                    Ok(raw) => mac(&secret, &data)?.verify_slice(&raw).is_ok(),
                    Err(_) => false,
                };
                Ok(json!({ "data": { "valid": valid } }))
            }
        }
    }
}

#[async_trait::async_trait]
impl Driver for KeyDriver {
    async fn execute(&self, request: BackendRequest, connection: &Value) -> Result<Value, CallError> {
        let op = match request {
            BackendRequest::Key(op) => op,
            other => {
                return Err(CallError::invalid(
                    "key",
                    format!("cannot execute a {} request", other.kind()),
                ))
            }
        };
        let keyring = connection
            .get("keyring")
            .and_then(Value::as_str)
            .unwrap_or("default");
        self.apply(keyring, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_model::BackendKind;

    async fn run(driver: &KeyDriver, v: Value) -> Result<Value, CallError> {
        let req = BackendRequest::parse(BackendKind::Key, &v)?;
        driver.execute(req, &json!({})).await
    }

    #[tokio::test]
    async fn sign_and_verify_round_trip() {
        let keys = KeyDriver::new();
        run(&keys, json!({"operation": "create", "name": "webhook"})).await.unwrap();
        let signed = run(&keys, json!({"operation": "sign", "name": "webhook", "data": "payload"}))
            .await
            .unwrap();
        let sig = signed["data"]["signature"].as_str().unwrap().to_string();

        let ok = run(
            &keys,
            json!({"operation": "verify", "name": "webhook", "data": "payload", "signature": sig}),
        )
        .await
        .unwrap();
        assert_eq!(ok["data"]["valid"], true);

        let tampered = run(
            &keys,
            json!({"operation": "verify", "name": "webhook", "data": "payload!", "signature": sig}),
        )
        .await
        .unwrap();
        assert_eq!(tampered["data"]["valid"], false);
    }

    #[tokio::test]
    async fn known_secret_gives_known_signature() {
        let keys = KeyDriver::new();
        run(
            &keys,
            json!({"operation": "create", "name": "k", "secret": STANDARD.encode("key")}),
        )
        .await
        .unwrap();
        let signed = run(
            &keys,
            json!({"operation": "sign", "name": "k", "data": "The quick brown fox jumps over the lazy dog"}),
        )
        .await
        .unwrap();
        // Well-known HMAC-SHA256 test vector.
        let expected = "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=";
        assert_eq!(signed["data"]["signature"], expected);
    }

    #[tokio::test]
    async fn list_delete_and_duplicates() {
        let keys = KeyDriver::new();
        run(&keys, json!({"operation": "create", "name": "b"})).await.unwrap();
        run(&keys, json!({"operation": "create", "name": "a"})).await.unwrap();
        let dup = run(&keys, json!({"operation": "create", "name": "a"})).await.unwrap_err();
        assert_eq!(dup.code(), "UPSTREAM_ERROR");
        let list = run(&keys, json!({"operation": "list"})).await.unwrap();
        assert_eq!(list["data"], json!(["a", "b"]));
        let del = run(&keys, json!({"operation": "delete", "name": "a"})).await.unwrap();
        assert_eq!(del["data"]["deleted"], true);
        let missing = run(&keys, json!({"operation": "sign", "name": "a", "data": "x"}))
            .await
            .unwrap_err();
        assert!(missing.to_string().contains("no key named"));
    }
}
