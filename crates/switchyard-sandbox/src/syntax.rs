//! Syntax checks for pipeline script, run when a pipeline is compiled.
//!
//! Transformation and component bodies execute as the body of an async
//! function, so they are parsed that way. Guards are single expressions.
//! Parsing is strict-mode, so sloppy-only syntax such as `with` is rejected.

use oxc_allocator::Allocator;
use oxc_ast::ast::{Statement, VariableDeclarationKind};
use oxc_parser::{ParseOptions, Parser};
use oxc_span::SourceType;

use crate::validator::{find_banned_pattern, DEFAULT_MAX_SCRIPT_SIZE};

/// Maximum bracket nesting depth before a script is rejected.
const MAX_NESTING_DEPTH: usize = 256;

/// Why a script was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ScriptCheckError {
    /// The script does not parse.
    #[error("syntax error: {0}")]
    Syntax(String),
    /// The script nests deeper than the parser is allowed to go.
    #[error("nesting depth {actual} exceeds maximum {max}")]
    NestingTooDeep {
        /// Maximum allowed depth.
        max: usize,
        /// Detected depth.
        actual: usize,
    },
    /// The script is larger than allowed.
    #[error("script exceeds maximum size of {max} bytes (got {actual})")]
    TooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },
    /// The script contains a banned pattern.
    #[error("banned pattern `{0}`: script has no module, runtime or code-generation access")]
    BannedPattern(String),
    /// A guard is empty or is not a single expression.
    #[error("not a single expression")]
    NotAnExpression,
}

/// Check bracket nesting depth before parsing.
fn check_nesting_depth(source: &str) -> Result<(), ScriptCheckError> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for b in source.bytes() {
        match b {
            b'(' | b'[' | b'{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        return Err(ScriptCheckError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
            actual: max_depth,
        });
    }
    Ok(())
}

fn parse(source: &str) -> Result<(), ScriptCheckError> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, source, SourceType::mjs()).parse();
    if ret.panicked {
        return Err(ScriptCheckError::Syntax(
            "parser gave up on malformed input".into(),
        ));
    }
    if let Some(first) = ret.errors.first() {
        return Err(ScriptCheckError::Syntax(first.to_string()));
    }
    Ok(())
}

fn precheck(source: &str) -> Result<(), ScriptCheckError> {
    check_size(source, DEFAULT_MAX_SCRIPT_SIZE)?;
    if let Some(pattern) = find_banned_pattern(source) {
        return Err(ScriptCheckError::BannedPattern(pattern.to_string()));
    }
    check_nesting_depth(source)
}

/// Reject a script larger than `max` bytes.
pub fn check_size(source: &str, max: usize) -> Result<(), ScriptCheckError> {
    if source.len() > max {
        return Err(ScriptCheckError::TooLarge {
            max,
            actual: source.len(),
        });
    }
    Ok(())
}

/// Check a transformation or component body.
pub fn check_script(source: &str) -> Result<(), ScriptCheckError> {
    precheck(source)?;
    parse(&format!("(async function () {{\n{source}\n}});"))
}

/// Strip surrounding whitespace and trailing semicolons from a guard.
pub fn normalize_conditional(expression: &str) -> &str {
    expression.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Check a guard expression.
///
/// The expression must parse in both a parenthesised and a bracketed
/// position: text that closes one bracket early to append a statement
/// leaves the other unbalanced. A trailing `;` is tolerated.
pub fn check_conditional(expression: &str) -> Result<(), ScriptCheckError> {
    let expression = normalize_conditional(expression);
    if expression.is_empty() {
        return Err(ScriptCheckError::NotAnExpression);
    }
    precheck(expression)?;
    parse(&format!(
        "(async function () {{ return !!(\n{expression}\n); }});"
    ))?;
    parse(&format!("[\n{expression}\n];")).map_err(|_| ScriptCheckError::NotAnExpression)
}

/// Globals a component body may not rebind.
const LOCKED_GLOBALS: &[&str] = &["AP", "session", "env", "log", "stop", "__sy", "globalThis"];

/// A component body whose top-level declarations are published on the
/// global object once the body finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hoisted {
    /// The body with top-level `let` and `const` turned into `var`.
    pub source: String,
    /// Variables declared at the top level of the body, in source order.
    pub names: Vec<String>,
    /// Functions declared at the top level of the body.
    pub functions: Vec<String>,
    /// The body opens with a `"use strict"` directive.
    pub strict: bool,
}

/// Find the top-level bindings of a component body.
///
/// Bodies share one global scope per request, so a `var x` in one
/// component is visible to the next. Returns `None` when the body does
/// not parse; it then runs unchanged and reports its own error.
pub(crate) fn hoist_declarations(body: &str) -> Option<Hoisted> {
    let allocator = Allocator::default();
    let options = ParseOptions {
        allow_return_outside_function: true,
        ..ParseOptions::default()
    };
    let ret = Parser::new(&allocator, body, SourceType::mjs())
        .with_options(options)
        .parse();
    if ret.panicked || !ret.errors.is_empty() {
        return None;
    }

    let mut names: Vec<String> = Vec::new();
    let mut functions: Vec<String> = Vec::new();
    let mut keywords: Vec<(usize, &str)> = Vec::new();
    let bind = |into: &mut Vec<String>, name: &str| {
        if !LOCKED_GLOBALS.contains(&name) && !into.iter().any(|n| n == name) {
            into.push(name.to_string());
        }
    };
    for statement in ret.program.body.iter() {
        match statement {
            Statement::VariableDeclaration(decl) => {
                match decl.kind {
                    VariableDeclarationKind::Var => {}
                    VariableDeclarationKind::Let => keywords.push((decl.span.start as usize, "let")),
                    VariableDeclarationKind::Const => {
                        keywords.push((decl.span.start as usize, "const"))
                    }
                    _ => continue,
                }
                for declarator in decl.declarations.iter() {
                    for ident in declarator.id.get_binding_identifiers() {
                        bind(&mut names, ident.name.as_str());
                    }
                }
            }
            Statement::FunctionDeclaration(function) => {
                if let Some(id) = &function.id {
                    bind(&mut functions, id.name.as_str());
                }
            }
            _ => {}
        }
    }

    let mut source = body.to_string();
    for (start, keyword) in keywords.into_iter().rev() {
        let end = start + keyword.len();
        if source.get(start..end) == Some(keyword) {
            source.replace_range(start..end, "var");
        }
    }
    let strict = ret.program.directives.iter().any(|d| d.is_use_strict());
    names.retain(|n| !functions.contains(n));
    Some(Hoisted {
        source,
        names,
        functions,
        strict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_function_body_with_return() {
        assert!(check_script("var a = 1;\nreturn a + 1;").is_ok());
    }

    #[test]
    fn accepts_await_in_body() {
        assert!(check_script("var r = await AP.makeRequest(req);").is_ok());
    }

    #[test]
    fn rejects_unbalanced_body() {
        let err = check_script("if (x) { y = 1;").unwrap_err();
        assert!(matches!(err, ScriptCheckError::Syntax(_)));
    }

    #[test]
    fn rejects_banned_pattern() {
        let err = check_script("eval('1')").unwrap_err();
        assert_eq!(err, ScriptCheckError::BannedPattern("eval(".into()));
    }

    #[test]
    fn rejects_deep_nesting() {
        let src = format!("{}1{}", "(".repeat(300), ")".repeat(300));
        assert!(matches!(
            check_script(&src),
            Err(ScriptCheckError::NestingTooDeep { actual: 300, .. })
        ));
    }

    #[test]
    fn size_limit_is_configurable() {
        assert!(check_size("return 1;", 64).is_ok());
        assert_eq!(
            check_size(&"x".repeat(65), 64),
            Err(ScriptCheckError::TooLarge { max: 64, actual: 65 })
        );
    }

    #[test]
    fn accepts_guard_expressions() {
        assert!(check_conditional("session.isSet(\"num\")").is_ok());
        assert!(check_conditional("request.params.clear == 'true' && true").is_ok());
    }

    #[test]
    fn rejects_malformed_guard() {
        assert!(check_conditional("request.method ==").is_err());
        assert!(check_conditional("   ").is_err());
    }

    #[test]
    fn guard_may_end_with_a_semicolon() {
        assert!(check_conditional("request.method == 'GET';").is_ok());
        assert!(check_conditional("true ; ").is_ok());
        assert_eq!(normalize_conditional(" a && b;\n"), "a && b");
        assert_eq!(check_conditional(";"), Err(ScriptCheckError::NotAnExpression));
    }

    #[test]
    fn top_level_declarations_are_hoisted() {
        let hoisted = hoist_declarations(
            "var x = 1;\nconst { a, b: [c] } = obj;\nlet y;\nfunction f() { var inner = 2; }\nif (x) { var nested = 3; }\nreturn stop;",
        )
        .unwrap();
        assert_eq!(hoisted.names, vec!["x", "a", "c", "y"]);
        assert_eq!(hoisted.functions, vec!["f"]);
        assert_eq!(
            hoisted.source,
            "var x = 1;\nvar { a, b: [c] } = obj;\nvar y;\nfunction f() { var inner = 2; }\nif (x) { var nested = 3; }\nreturn stop;"
        );
    }

    #[test]
    fn locked_globals_are_not_hoisted() {
        let hoisted = hoist_declarations("var response = 1; var log = 2;").unwrap();
        assert_eq!(hoisted.names, vec!["response"]);
        assert!(!hoisted.strict);
        assert!(hoist_declarations("'use strict';\nlet a = 1;").unwrap().strict);
    }

    #[test]
    fn unparsable_body_is_not_hoisted() {
        assert_eq!(hoist_declarations("var = ;"), None);
    }

    #[test]
    fn rejects_statement_smuggled_into_guard() {
        assert_eq!(
            check_conditional("1); log('x'"),
            Err(ScriptCheckError::NotAnExpression)
        );
    }
}
