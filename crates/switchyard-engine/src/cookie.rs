//! Session cookies.
//!
//! The cookie value is `<session id>.<signature>`, the signature being the
//! unpadded base64url HMAC-SHA256 of the id under the environment's auth key.
//! Verification accepts the primary key, then the rotate key, so a key can
//! be rotated without dropping live sessions. A value that fails both is
//! treated as no cookie at all.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use switchyard_model::SessionSettings;
use switchyard_sandbox::SessionHandle;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies session ids for one environment.
#[derive(Clone)]
pub struct CookieSigner {
    primary: Vec<u8>,
    rotate: Option<Vec<u8>>,
}

impl CookieSigner {
    /// Signer for `settings`. `fallback_key` signs when the environment has
    /// no auth key.
    pub fn new(settings: &SessionSettings, fallback_key: &[u8]) -> Self {
        let primary = if settings.auth_key.is_empty() {
            fallback_key.to_vec()
        } else {
            settings.auth_key.as_bytes().to_vec()
        };
        let rotate = (!settings.auth_key_rotate.is_empty())
            .then(|| settings.auth_key_rotate.as_bytes().to_vec());
        Self { primary, rotate }
    }

    /// The cookie value for a session id, `None` if the key is unusable.
    pub fn sign(&self, id: &str) -> Option<String> {
        let signature = URL_SAFE_NO_PAD.encode(mac(&self.primary, id)?.finalize().into_bytes());
        Some(format!("{id}.{signature}"))
    }

    /// The session id of a cookie value, if its signature checks out.
    pub fn verify(&self, value: &str) -> Option<String> {
        let (id, signature) = value.rsplit_once('.')?;
        if id.is_empty() {
            return None;
        }
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let valid = std::iter::once(&self.primary)
            .chain(self.rotate.as_ref())
            .filter_map(|key| mac(key, id))
            .any(|mac| mac.verify_slice(&signature).is_ok());
        valid.then(|| id.to_string())
    }
}

fn mac(key: &[u8], id: &str) -> Option<HmacSha256> {
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(e) => {
            tracing::error!(error = %e, "session signing key rejected");
            return None;
        }
    };
    mac.update(id.as_bytes());
    Some(mac)
}

/// Value of the cookie `name` among the request's `Cookie` headers.
pub fn read_cookie(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, v)| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"').to_string())
}

/// The `Set-Cookie` value for a finished request, if one is needed.
///
/// Options set by script override the environment settings. A destroyed
/// session expires the cookie.
pub fn set_cookie(
    settings: &SessionSettings,
    signer: &CookieSigner,
    session: &SessionHandle,
) -> Option<String> {
    if !session.needs_cookie() {
        return None;
    }
    let options = session.options();
    let path = options
        .and_then(|o| o.path.clone())
        .unwrap_or_else(|| settings.path.clone());
    let domain = options
        .and_then(|o| o.domain.clone())
        .unwrap_or_else(|| settings.domain.clone());
    let secure = options.and_then(|o| o.secure).unwrap_or(settings.secure);
    let http_only = options.and_then(|o| o.http_only).unwrap_or(settings.http_only);

    let (value, max_age) = match session.id() {
        Some(id) if !session.destroyed() => (
            signer.sign(id)?,
            options
                .and_then(|o| o.max_age)
                .filter(|age| *age != 0)
                .unwrap_or(settings.max_age),
        ),
        _ => (String::new(), 0),
    };

    let mut cookie = format!("{}={value}", settings.cookie_name);
    if !path.is_empty() {
        cookie.push_str(&format!("; Path={path}"));
    }
    if !domain.is_empty() {
        cookie.push_str(&format!("; Domain={domain}"));
    }
    cookie.push_str(&format!("; Max-Age={}", max_age.max(0)));
    if secure {
        cookie.push_str("; Secure");
    }
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    Some(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use switchyard_sandbox::{CookieOptions, SessionStore};

    fn settings(auth: &str, rotate: &str) -> SessionSettings {
        SessionSettings {
            auth_key: auth.into(),
            auth_key_rotate: rotate.into(),
            ..Default::default()
        }
    }

    #[test]
    fn sign_then_verify() {
        let signer = CookieSigner::new(&settings("k1", ""), b"unused");
        let value = signer.sign("abc123").unwrap();
        assert!(value.starts_with("abc123."));
        assert_eq!(signer.verify(&value).as_deref(), Some("abc123"));
    }

    #[test]
    fn tampered_values_are_rejected() {
        let signer = CookieSigner::new(&settings("k1", ""), b"unused");
        let value = signer.sign("abc123").unwrap();
        let forged = value.replacen("abc123", "abc124", 1);
        assert!(signer.verify(&forged).is_none());
        assert!(signer.verify("abc123").is_none());
        assert!(signer.verify(".sig").is_none());
        assert!(signer.verify("abc123.!!!").is_none());
    }

    #[test]
    fn rotate_key_still_verifies() {
        let old = CookieSigner::new(&settings("old", ""), b"unused");
        let value = old.sign("sess").unwrap();
        let rotated = CookieSigner::new(&settings("new", "old"), b"unused");
        assert_eq!(rotated.verify(&value).as_deref(), Some("sess"));
        assert!(rotated.sign("sess").unwrap() != value);

        let dropped = CookieSigner::new(&settings("new", ""), b"unused");
        assert!(dropped.verify(&value).is_none());
    }

    #[test]
    fn fallback_key_when_unset() {
        let a = CookieSigner::new(&settings("", ""), b"process-key");
        let b = CookieSigner::new(&settings("", ""), b"other-key");
        let value = a.sign("x").unwrap();
        assert!(b.verify(&value).is_none());
        assert!(a.verify(&value).is_some());
    }

    #[test]
    fn empty_key_still_signs() {
        let signer = CookieSigner::new(&settings("", ""), b"");
        let value = signer.sign("sess").unwrap();
        assert_eq!(signer.verify(&value).as_deref(), Some("sess"));
        assert!(mac(b"", "sess").is_some());
        assert!(mac(&[7u8; 512], "sess").is_some());
    }

    #[test]
    fn reads_named_cookie() {
        let headers = vec![
            ("Accept".to_string(), "*/*".to_string()),
            ("Cookie".to_string(), "a=1; switchyard_session=abc.def; b=2".to_string()),
        ];
        assert_eq!(
            read_cookie(&headers, "switchyard_session").as_deref(),
            Some("abc.def")
        );
        assert!(read_cookie(&headers, "missing").is_none());
    }

    #[test]
    fn set_cookie_only_when_needed() {
        let store = Arc::new(SessionStore::default());
        let s = settings("k", "");
        let signer = CookieSigner::new(&s, b"");

        let untouched = SessionHandle::new(store.clone(), None);
        assert!(set_cookie(&s, &signer, &untouched).is_none());

        let mut written = SessionHandle::new(store.clone(), None);
        written.set("num", serde_json::json!(1)).unwrap();
        let cookie = set_cookie(&s, &signer, &written).unwrap();
        let id = written.id().unwrap();
        assert!(cookie.starts_with(&format!("switchyard_session={}", signer.sign(id).unwrap())));
        assert!(cookie.contains("; Path=/"));
        assert!(cookie.contains("; Max-Age=2592000"));
        assert!(cookie.ends_with("; HttpOnly"));
    }

    #[test]
    fn script_options_override_and_negative_max_age_expires() {
        let store = Arc::new(SessionStore::default());
        let s = settings("k", "");
        let signer = CookieSigner::new(&s, b"");

        let mut handle = SessionHandle::new(store.clone(), Some("existing".into()));
        handle.set_options(CookieOptions {
            max_age: Some(60),
            domain: Some("example.com".into()),
            secure: Some(true),
            ..Default::default()
        });
        let cookie = set_cookie(&s, &signer, &handle).unwrap();
        assert!(cookie.contains("; Domain=example.com"));
        assert!(cookie.contains("; Max-Age=60"));
        assert!(cookie.contains("; Secure"));

        handle.set_options(CookieOptions {
            max_age: Some(-1),
            ..Default::default()
        });
        let cookie = set_cookie(&s, &signer, &handle).unwrap();
        assert!(cookie.starts_with("switchyard_session=;"));
        assert!(cookie.contains("; Max-Age=0"));
    }
}
