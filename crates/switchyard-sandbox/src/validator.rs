//! Pre-compilation checks on operator script.
//!
//! The V8 isolate is the security boundary. These checks reject obvious
//! escape attempts when a pipeline is compiled, so a bad definition never
//! becomes executable.

/// Maximum script size in bytes (256 KB).
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 256 * 1024;

/// Patterns that are banned from pipeline script.
const BANNED_PATTERNS: &[&str] = &[
    "eval(",
    "new Function",
    "Function(",
    "import(",
    "require(",
    "Deno.",
    "__proto__",
    "constructor.constructor",
    "constructor[",
    "process.env",
    "process.exit",
    "process.binding",
];

/// Return the first banned pattern found in `source`, if any.
pub fn find_banned_pattern(source: &str) -> Option<&'static str> {
    BANNED_PATTERNS
        .iter()
        .find(|pattern| source.contains(*pattern))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_transformation() {
        let src = r#"response.body = JSON.stringify({ a: 1 });"#;
        assert_eq!(find_banned_pattern(src), None);
    }

    #[test]
    fn rejects_eval() {
        assert_eq!(find_banned_pattern("eval('1')"), Some("eval("));
    }

    #[test]
    fn rejects_function_constructor() {
        assert_eq!(
            find_banned_pattern("var f = new Function('return 1')"),
            Some("new Function")
        );
        assert!(find_banned_pattern("x.constructor.constructor('x')").is_some());
    }

    #[test]
    fn rejects_runtime_escape() {
        assert_eq!(find_banned_pattern("Deno.core.ops"), Some("Deno."));
        assert_eq!(find_banned_pattern("import('fs')"), Some("import("));
    }

    #[test]
    fn allows_process_as_data_field() {
        assert_eq!(find_banned_pattern("data.process.status"), None);
    }
}
