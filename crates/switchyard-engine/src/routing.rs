//! Route matcher.
//!
//! Routes are predicate sets over method, host, scheme, path, headers and
//! query. Path, host and value templates use `{name}` or `{name:regex}`
//! placeholders; the default placeholder pattern is one path segment for
//! paths, one label for hosts and anything for header and query values.
//!
//! When several routes match, the most specific tier wins: a full-path route
//! with predicates beyond the path, then a full-path route with the path
//! alone, then a prefix route. Within a tier the first registered route wins.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use switchyard_model::RouteSpec;

use crate::error::CompilationError;

/// The parts of an inbound request a route can test.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    /// Request method.
    pub method: &'a str,
    /// `Host` header value, possibly with a port.
    pub host: &'a str,
    /// URL path.
    pub path: &'a str,
    /// `http` or `https`.
    pub scheme: &'a str,
    /// Header pairs, names in any case.
    pub headers: &'a [(String, String)],
    /// Decoded query pairs.
    pub query: &'a [(String, String)],
}

#[derive(Debug, Clone, Copy)]
enum TemplateKind {
    Path,
    Host,
    Value,
}

impl TemplateKind {
    fn default_pattern(self) -> &'static str {
        match self {
            Self::Path => "[^/]+",
            Self::Host => "[^.]+",
            Self::Value => ".*",
        }
    }
}

/// A compiled `{name:regex}` template.
#[derive(Debug, Clone)]
struct Template {
    regex: Regex,
    vars: Vec<String>,
}

impl Template {
    fn compile(source: &str, kind: TemplateKind, whole: bool) -> Result<Self, String> {
        let mut pattern = String::from("^");
        let mut vars = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find('{') {
            pattern.push_str(&regex::escape(&rest[..open]));
            let after = &rest[open + 1..];
            let close = matching_brace(after)
                .ok_or_else(|| format!("unbalanced braces in '{source}'"))?;
            let placeholder = &after[..close];
            let (name, regex) = match placeholder.split_once(':') {
                Some((name, regex)) => (name.trim(), regex),
                None => (placeholder.trim(), kind.default_pattern()),
            };
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(format!("invalid variable name '{name}' in '{source}'"));
            }
            if regex.is_empty() {
                return Err(format!("empty pattern for '{name}' in '{source}'"));
            }
            pattern.push_str(&format!("(?P<sy{}>{regex})", vars.len()));
            vars.push(name.to_string());
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(format!("unbalanced braces in '{source}'"));
        }
        pattern.push_str(&regex::escape(rest));
        if whole {
            pattern.push('$');
        }

        let regex = Regex::new(&pattern).map_err(|e| e.to_string())?;
        Ok(Self { regex, vars })
    }

    fn captures(&self, input: &str, into: &mut BTreeMap<String, String>) -> bool {
        let Some(caps) = self.regex.captures(input) else {
            return false;
        };
        for (i, name) in self.vars.iter().enumerate() {
            if let Some(m) = caps.name(&format!("sy{i}")) {
                into.insert(name.clone(), m.as_str().to_string());
            }
        }
        true
    }
}

/// Offset of the `}` closing a placeholder whose `{` was just consumed.
fn matching_brace(s: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// A value predicate: presence only, or a template the value must match.
#[derive(Debug, Clone)]
struct ValuePredicate {
    key: String,
    template: Option<Template>,
}

impl ValuePredicate {
    fn compile(key: &str, template: &str) -> Result<Self, String> {
        let template = if template.is_empty() {
            None
        } else {
            Some(Template::compile(template, TemplateKind::Value, true)?)
        };
        Ok(Self {
            key: key.to_string(),
            template,
        })
    }

    fn test<'a>(
        &self,
        mut values: impl Iterator<Item = &'a str>,
        vars: &mut BTreeMap<String, String>,
    ) -> bool {
        match &self.template {
            None => values.next().is_some(),
            Some(template) => values.any(|v| template.captures(v, vars)),
        }
    }
}

/// One compiled route of a proxy endpoint.
#[derive(Debug, Clone)]
pub struct Route {
    endpoint_id: String,
    name: Option<String>,
    path: String,
    prefix: bool,
    methods: Vec<String>,
    path_template: Template,
    hosts: Vec<(Template, bool)>,
    explicit_host: bool,
    schemes: Vec<String>,
    headers: Vec<ValuePredicate>,
    queries: Vec<ValuePredicate>,
    preflight: bool,
}

impl Route {
    /// Compile a route spec of `endpoint_id`.
    ///
    /// `api_hosts` apply when the route has no host of its own. With
    /// `cors_enabled`, a route that lists methods but not `OPTIONS` also
    /// accepts `OPTIONS` for preflight.
    pub fn compile(
        endpoint_id: &str,
        index: usize,
        spec: &RouteSpec,
        api_hosts: &[String],
        cors_enabled: bool,
    ) -> Result<Self, CompilationError> {
        let location = format!("{endpoint_id}.routes[{index}]");
        let invalid = |reason: String| CompilationError::InvalidRoute {
            location: location.clone(),
            reason,
        };

        if spec.path.is_empty() && !spec.prefix {
            return Err(invalid("path must not be empty".into()));
        }
        let path_template = Template::compile(&spec.path, TemplateKind::Path, !spec.prefix)
            .map_err(invalid)?;

        let host_sources: Vec<&str> = match &spec.host {
            Some(host) => vec![host.as_str()],
            None => api_hosts.iter().map(String::as_str).collect(),
        };
        let hosts = host_sources
            .into_iter()
            .map(|h| {
                let with_port = h.rsplit('}').next().unwrap_or(h).contains(':');
                Template::compile(&h.to_ascii_lowercase(), TemplateKind::Host, true)
                    .map(|t| (t, with_port))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;

        let headers = spec
            .headers
            .iter()
            .map(|(k, v)| ValuePredicate::compile(&k.to_ascii_lowercase(), v))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        let queries = spec
            .queries
            .iter()
            .map(|(k, v)| ValuePredicate::compile(k, v))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;

        let methods: Vec<String> = spec.methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        let preflight = cors_enabled && !methods.is_empty() && !methods.iter().any(|m| m == "OPTIONS");

        Ok(Self {
            endpoint_id: endpoint_id.to_string(),
            name: spec.name.clone(),
            path: spec.path.clone(),
            prefix: spec.prefix,
            methods,
            path_template,
            hosts,
            explicit_host: spec.host.is_some(),
            schemes: spec.schemes.iter().map(|s| s.to_ascii_lowercase()).collect(),
            headers,
            queries,
            preflight,
        })
    }

    /// Id of the proxy endpoint this route selects.
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Route name, if configured.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The path template as configured.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the route itself accepts `OPTIONS`, as opposed to accepting it
    /// only for CORS preflight.
    pub fn handles_options(&self) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == "OPTIONS")
    }

    /// Specificity tier; lower is more specific.
    fn tier(&self) -> u8 {
        if self.prefix {
            2
        } else if !self.methods.is_empty()
            || self.explicit_host
            || !self.schemes.is_empty()
            || !self.headers.is_empty()
            || !self.queries.is_empty()
        {
            0
        } else {
            1
        }
    }

    fn accepts_method(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
            || (self.preflight && method.eq_ignore_ascii_case("OPTIONS"))
    }

    fn matches(&self, request: &RouteRequest<'_>) -> Option<BTreeMap<String, String>> {
        if !self.accepts_method(request.method) {
            return None;
        }
        if !self.schemes.is_empty()
            && !self.schemes.iter().any(|s| s.eq_ignore_ascii_case(request.scheme))
        {
            return None;
        }

        let mut vars = BTreeMap::new();
        if !self.hosts.is_empty() {
            let host = request.host.to_ascii_lowercase();
            let matched = self.hosts.iter().any(|(template, with_port)| {
                let candidate = if *with_port {
                    host.as_str()
                } else {
                    strip_port(&host)
                };
                template.captures(candidate, &mut vars)
            });
            if !matched {
                return None;
            }
        }

        if !self.path_template.captures(request.path, &mut vars) {
            return None;
        }

        for predicate in &self.headers {
            let values = request
                .headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case(&predicate.key))
                .map(|(_, v)| v.as_str());
            if !predicate.test(values, &mut vars) {
                return None;
            }
        }
        for predicate in &self.queries {
            let values = request
                .query
                .iter()
                .filter(|(k, _)| *k == predicate.key)
                .map(|(_, v)| v.as_str());
            if !predicate.test(values, &mut vars) {
                return None;
            }
        }
        Some(vars)
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// A successful match.
#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    /// The matched route.
    pub route: &'a Route,
    /// Variables captured from path, host and query templates.
    pub vars: BTreeMap<String, String>,
}

/// All live routes, in registration order.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
    methods_by_path: BTreeMap<String, BTreeSet<String>>,
}

impl RouteTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route after every route already present.
    pub fn push(&mut self, route: Route) {
        let methods = self.methods_by_path.entry(route.path.clone()).or_default();
        methods.extend(route.methods.iter().cloned());
        self.routes.push(route);
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the best route for a request.
    pub fn find(&self, request: &RouteRequest<'_>) -> Option<RouteMatch<'_>> {
        let mut best: Option<(u8, RouteMatch<'_>)> = None;
        for route in &self.routes {
            let tier = route.tier();
            if best.as_ref().is_some_and(|(t, _)| *t <= tier) {
                continue;
            }
            if let Some(vars) = route.matches(request) {
                best = Some((tier, RouteMatch { route, vars }));
                if tier == 0 {
                    break;
                }
            }
        }
        best.map(|(_, m)| m)
    }

    /// Methods registered for a path template across all routes, plus
    /// `OPTIONS`, sorted. Used for `Access-Control-Allow-Methods`.
    pub fn allowed_methods(&self, path: &str) -> Vec<String> {
        let mut methods = self.methods_by_path.get(path).cloned().unwrap_or_default();
        methods.insert("OPTIONS".to_string());
        methods.into_iter().collect()
    }
}
