//! Pipeline loader.
//!
//! Turns a [`ProxyEndpointDefinition`] into an immutable [`Pipeline`]:
//! shared components resolved, guards and scripts syntax-checked, calls bound
//! to their remote endpoints and routes compiled. Results are cached by
//! `(id, version)`; a cached entry is returned without touching the catalog.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use switchyard_model::{
    CallSpec, Catalog, CompiledCall, CompiledComponent, Component, ComponentKind, Conditional,
    Pipeline, ProxyEndpointDefinition, Script, Step, Transformation,
};
use switchyard_sandbox::{check_conditional, check_script, check_size, normalize_conditional};

use crate::error::CompilationError;
use crate::routing::Route;

/// Default maximum size of one script or guard.
pub const DEFAULT_MAX_SCRIPT_BYTES: usize = 64 * 1024;

/// A compiled proxy endpoint: its pipeline and its routes.
#[derive(Debug)]
pub struct CompiledEndpoint {
    /// The executable pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Compiled routes, in declared order.
    pub routes: Vec<Route>,
    /// Answer preflight and tag responses with CORS headers.
    pub cors_enabled: bool,
}

/// Compiles definitions and caches the results.
pub struct PipelineLoader {
    max_script_bytes: usize,
    cache: RwLock<HashMap<(String, u64), Arc<CompiledEndpoint>>>,
}

impl PipelineLoader {
    /// A loader rejecting scripts larger than `max_script_bytes`.
    pub fn new(max_script_bytes: usize) -> Self {
        Self {
            max_script_bytes,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Compiled form of `definition`, from cache when this version was
    /// compiled before.
    pub fn load(
        &self,
        catalog: &Catalog,
        definition: &ProxyEndpointDefinition,
    ) -> Result<Arc<CompiledEndpoint>, CompilationError> {
        let key = (definition.id.clone(), definition.version);
        if let Some(hit) = self.cached(&key.0, key.1) {
            return Ok(hit);
        }

        let compiled = Arc::new(compile(catalog, definition, self.max_script_bytes)?);
        tracing::debug!(
            endpoint = %definition.name,
            version = definition.version,
            components = compiled.pipeline.components.len(),
            "pipeline compiled"
        );
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(key).or_insert(compiled).clone())
    }

    /// Cached pipeline for `(id, version)`, if any.
    pub fn cached(&self, id: &str, version: u64) -> Option<Arc<CompiledEndpoint>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(&(id.to_string(), version)).cloned()
    }

    /// Drop every cached pipeline.
    pub fn invalidate(&self) {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of cached pipelines.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PipelineLoader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCRIPT_BYTES)
    }
}

/// Compile a definition against a catalog.
pub fn compile(
    catalog: &Catalog,
    definition: &ProxyEndpointDefinition,
    max_script_bytes: usize,
) -> Result<CompiledEndpoint, CompilationError> {
    if definition.routes.is_empty() {
        return Err(CompilationError::NoRoutes(definition.id.clone()));
    }

    let api = if definition.api.is_empty() {
        None
    } else {
        Some(catalog.api(&definition.api).ok_or_else(|| CompilationError::UnknownReference {
            what: "api",
            name: definition.api.clone(),
        })?)
    };
    if !definition.environment.is_empty() && catalog.environment(&definition.environment).is_none()
    {
        return Err(CompilationError::UnknownReference {
            what: "environment",
            name: definition.environment.clone(),
        });
    }

    let checker = Checker { max_script_bytes };
    let api_hosts = api.map(|a| a.hosts.as_slice()).unwrap_or_default();
    let routes = definition
        .routes
        .iter()
        .enumerate()
        .map(|(i, spec)| Route::compile(&definition.id, i, spec, api_hosts, definition.cors_enabled))
        .collect::<Result<Vec<_>, _>>()?;

    let libraries = api
        .map(|a| a.libraries.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|lib| checker.script(format!("library[{}]", lib.name), &lib.script))
        .collect::<Result<Vec<_>, _>>()?;

    let components = definition
        .components
        .iter()
        .enumerate()
        .map(|(i, component)| compile_component(catalog, &checker, i, component))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledEndpoint {
        pipeline: Arc::new(Pipeline {
            endpoint_id: definition.id.clone(),
            name: definition.name.clone(),
            version: definition.version,
            api: definition.api.clone(),
            environment: definition.environment.clone(),
            libraries,
            components,
        }),
        routes,
        cors_enabled: definition.cors_enabled,
    })
}

struct Checker {
    max_script_bytes: usize,
}

impl Checker {
    fn script(&self, label: String, source: &str) -> Result<Script, CompilationError> {
        check_size(source, self.max_script_bytes)
            .and_then(|_| check_script(source))
            .map_err(|e| CompilationError::InvalidScript {
                location: label.clone(),
                reason: e.to_string(),
            })?;
        Ok(Script::new(label, source))
    }

    fn transformations(
        &self,
        prefix: &str,
        which: &str,
        list: &[Transformation],
    ) -> Result<Vec<Script>, CompilationError> {
        list.iter()
            .enumerate()
            .map(|(j, t)| {
                let label = format!("{prefix}.{which}[{j}]");
                if t.kind != "js" {
                    return Err(CompilationError::InvalidScript {
                        location: label,
                        reason: format!("unsupported transformation type '{}'", t.kind),
                    });
                }
                self.script(label, &t.data)
            })
            .collect()
    }

    fn conditional(
        &self,
        location: String,
        expression: Option<&str>,
        positive: bool,
    ) -> Result<Option<Conditional>, CompilationError> {
        let Some(expression) = expression.filter(|e| !e.trim().is_empty()) else {
            return Ok(None);
        };
        check_size(expression, self.max_script_bytes)
            .and_then(|_| check_conditional(expression))
            .map_err(|e| CompilationError::MalformedConditional {
                location,
                reason: e.to_string(),
            })?;
        Ok(Some(Conditional {
            expression: normalize_conditional(expression).to_string(),
            positive,
        }))
    }
}

/// Globals every script sees; a call may not take one of these names.
const SCRIPT_GLOBALS: &[&str] = &[
    "AP", "request", "response", "session", "env", "log", "stop", "console", "globalThis",
    "__sy", "undefined", "NaN", "Infinity", "JSON", "Object", "Array", "String", "Number",
    "Boolean", "Math", "Date", "Promise", "Error", "RegExp", "Symbol",
];

const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield", "arguments",
    "eval",
];

/// A call is bound to a global of its name, so the name must be a plain
/// identifier that shadows nothing the scripts rely on.
fn check_call_name(location: &str, name: &str) -> Result<(), CompilationError> {
    let mut chars = name.chars();
    let identifier = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    let reason = if !identifier {
        format!("call name '{name}' is not a valid identifier")
    } else if SCRIPT_GLOBALS.contains(&name) {
        format!("call name '{name}' collides with a script global")
    } else if RESERVED_WORDS.contains(&name) {
        format!("call name '{name}' is a reserved word")
    } else {
        return Ok(());
    };
    Err(CompilationError::InvalidComponent {
        location: location.to_string(),
        reason,
    })
}

fn compile_component(
    catalog: &Catalog,
    checker: &Checker,
    index: usize,
    component: &Component,
) -> Result<CompiledComponent, CompilationError> {
    let label = format!("component[{index}]");
    let component = match &component.shared_component {
        Some(id) => {
            let shared = catalog.shared_component(id).ok_or_else(|| {
                CompilationError::DanglingSharedComponent {
                    location: label.clone(),
                    id: id.clone(),
                }
            })?;
            if shared.component.shared_component.is_some() {
                return Err(CompilationError::InvalidComponent {
                    location: label,
                    reason: format!("shared component '{id}' references another shared component"),
                });
            }
            &shared.component
        }
        None => component,
    };

    let conditional = checker.conditional(
        format!("{label}.conditional"),
        component.conditional.as_deref(),
        component.conditional_positive,
    )?;
    let before = checker.transformations(&label, "before", &component.before)?;
    let after = checker.transformations(&label, "after", &component.after)?;

    let step = match component.kind {
        ComponentKind::Single => {
            let call = component.call.as_ref().ok_or_else(|| CompilationError::InvalidComponent {
                location: label.clone(),
                reason: "single component has no call".into(),
            })?;
            Step::Calls(vec![compile_call(catalog, checker, &label, 0, call)?])
        }
        ComponentKind::Multi => {
            if component.calls.is_empty() {
                return Err(CompilationError::InvalidComponent {
                    location: label,
                    reason: "multi component has no calls".into(),
                });
            }
            let calls = component
                .calls
                .iter()
                .enumerate()
                .map(|(k, call)| compile_call(catalog, checker, &label, k, call))
                .collect::<Result<Vec<_>, _>>()?;
            for (k, call) in calls.iter().enumerate() {
                if calls[..k].iter().any(|c| c.name == call.name) {
                    return Err(CompilationError::InvalidComponent {
                        location: format!("{label}.calls[{k}]"),
                        reason: format!("call name '{}' is used twice", call.name),
                    });
                }
            }
            Step::Calls(calls)
        }
        ComponentKind::Js => {
            let source = component
                .script
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| CompilationError::InvalidComponent {
                    location: label.clone(),
                    reason: "js component has no script".into(),
                })?;
            Step::Script(checker.script(label.clone(), source)?)
        }
    };

    Ok(CompiledComponent {
        label,
        conditional,
        before,
        step,
        after,
    })
}

fn compile_call(
    catalog: &Catalog,
    checker: &Checker,
    component: &str,
    index: usize,
    call: &CallSpec,
) -> Result<CompiledCall, CompilationError> {
    let prefix = format!("{component}.calls[{index}]");
    let remote = catalog.remote_endpoint(&call.remote_endpoint).ok_or_else(|| {
        CompilationError::UnknownRemoteEndpoint {
            location: prefix.clone(),
            name: call.remote_endpoint.clone(),
        }
    })?;
    let name = call
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| remote.name.clone());
    check_call_name(&prefix, &name)?;

    Ok(CompiledCall {
        name,
        remote_endpoint: remote.name.clone(),
        backend: remote.kind,
        conditional: checker.conditional(
            format!("{prefix}.conditional"),
            call.conditional.as_deref(),
            call.conditional_positive,
        )?,
        before: checker.transformations(&prefix, "before", &call.before)?,
        after: checker.transformations(&prefix, "after", &call.after)?,
    })
}
