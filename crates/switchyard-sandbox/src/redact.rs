//! Redaction of script error messages before they leave the gateway.
//!
//! Environments with `show_script_errors` return the script's error message
//! to the caller. Connection details, file paths, credentials and stack
//! frames are stripped first; the message itself is kept.

use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[a-z][a-z0-9+.\-]*://[^\s'")\]}>]+"#).expect("static regex"));

static IP_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?").expect("static regex")
});

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run)(/[\w.\-]+)+")
        .expect("static regex")
});

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|Basic\s+[A-Za-z0-9+/=]{8,}|api_key\s*=\s*\S+|token\s*=\s*\S+|password\s*=\s*\S+|secret\s*=\s*\S+)",
    )
    .expect("static regex")
});

/// JWT tokens (three base64url-encoded segments separated by dots).
static JWT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").expect("static regex")
});

/// V8 stack frames (`    at foo (file:1:2)`).
static STACK_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*at\s+.+$").expect("static regex"));

/// Redact sensitive patterns from a script error message.
///
/// - URLs and connection strings → `[url]`
/// - IP:port addresses → `[addr]`
/// - Unix file paths → `[path]`
/// - Credentials and JWTs → `[REDACTED]`
/// - Stack frames → removed
pub fn redact_error_message(error: &str) -> String {
    let mut msg = JWT_RE.replace_all(error, "[REDACTED]").to_string();
    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = URL_RE.replace_all(&msg, "[url]").to_string();
    msg = IP_PORT_RE.replace_all(&msg, "[addr]").to_string();
    msg = UNIX_PATH_RE.replace_all(&msg, "[path]").to_string();
    msg = STACK_FRAME_RE.replace_all(&msg, "").to_string();

    let lines: Vec<&str> = msg.lines().filter(|l| !l.trim().is_empty()).collect();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_plain_messages() {
        assert_eq!(
            redact_error_message("TypeError: x is not a function"),
            "TypeError: x is not a function"
        );
    }

    #[test]
    fn strips_urls_and_addresses() {
        let out = redact_error_message("cannot reach http://10.0.0.5:8080/api and 10.0.0.6:5432");
        assert!(!out.contains("10.0.0.5"), "{out}");
        assert!(out.contains("[url]"));
        assert!(out.contains("[addr]"));
    }

    #[test]
    fn strips_connection_strings() {
        let out = redact_error_message("dial postgres://app:hunter2@db/prod failed");
        assert!(!out.contains("hunter2"), "{out}");
    }

    #[test]
    fn strips_credentials() {
        let out = redact_error_message("header was Bearer abc.def.ghi");
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("abc.def"));
    }

    #[test]
    fn strips_stack_frames() {
        let out = redact_error_message(
            "Error: boom\n    at component (switchyard:1:10)\n    at async run (x:2:3)",
        );
        assert_eq!(out, "Error: boom");
    }

    #[test]
    fn strips_paths() {
        let out = redact_error_message("ENOENT /etc/switchyard/secret.toml");
        assert_eq!(out, "ENOENT [path]");
    }
}
