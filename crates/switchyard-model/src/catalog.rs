//! Configuration entities as authored through the configuration service.
//!
//! A [`Catalog`] is a complete snapshot of everything the engine needs:
//! APIs, environments, remote endpoints, shared components and proxy
//! endpoint definitions. The engine never mutates a catalog; a change is a
//! new snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::BackendKind;

fn default_true() -> bool {
    true
}

fn default_version() -> u64 {
    1
}

/// A complete configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    /// APIs that group proxy endpoints.
    pub apis: Vec<Api>,
    /// Deployment environments.
    pub environments: Vec<Environment>,
    /// Named backend connections.
    pub remote_endpoints: Vec<RemoteEndpoint>,
    /// Reusable components, referenced by id.
    pub shared_components: Vec<SharedComponentDefinition>,
    /// Proxy endpoint definitions.
    pub proxy_endpoints: Vec<ProxyEndpointDefinition>,
}

impl Catalog {
    /// Start building a catalog.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Look up an API by name.
    pub fn api(&self, name: &str) -> Option<&Api> {
        self.apis.iter().find(|a| a.name == name)
    }

    /// Look up an environment by name.
    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// Look up a remote endpoint by name.
    pub fn remote_endpoint(&self, name: &str) -> Option<&RemoteEndpoint> {
        self.remote_endpoints.iter().find(|r| r.name == name)
    }

    /// Look up a shared component by id.
    pub fn shared_component(&self, id: &str) -> Option<&SharedComponentDefinition> {
        self.shared_components.iter().find(|s| s.id == id)
    }

    /// Look up a proxy endpoint by id.
    pub fn proxy_endpoint(&self, id: &str) -> Option<&ProxyEndpointDefinition> {
        self.proxy_endpoints.iter().find(|p| p.id == id)
    }

    /// Look up a proxy endpoint by its display name.
    pub fn proxy_endpoint_by_name(&self, name: &str) -> Option<&ProxyEndpointDefinition> {
        self.proxy_endpoints.iter().find(|p| p.name == name)
    }
}

/// An API groups proxy endpoints and carries their shared settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Api {
    /// Unique name.
    pub name: String,
    /// Host patterns that apply to routes without their own host predicate.
    pub hosts: Vec<String>,
    /// CORS response settings.
    pub cors: CorsSettings,
    /// Script libraries evaluated before every pipeline of this API.
    pub libraries: Vec<Library>,
}

/// CORS response settings for an API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    /// `Access-Control-Allow-Origin`.
    pub allow_origin: String,
    /// `Access-Control-Allow-Headers`.
    pub allow_headers: String,
    /// `Access-Control-Request-Headers`.
    pub request_headers: String,
    /// `Access-Control-Max-Age` in seconds.
    pub max_age: u64,
    /// Emit `Access-Control-Allow-Credentials: true`.
    pub allow_credentials: bool,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allow_origin: "*".into(),
            allow_headers: "content-type, accept".into(),
            request_headers: "*".into(),
            max_age: 600,
            allow_credentials: false,
        }
    }
}

/// A named script library.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Library {
    /// Library name, used in error locations.
    pub name: String,
    /// Script source.
    pub script: String,
}

/// A deployment environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    /// Unique name.
    pub name: String,
    /// Values visible to pipeline script through `env`.
    pub values: serde_json::Map<String, Value>,
    /// Session cookie settings.
    pub session: SessionSettings,
    /// Include script error messages in fault responses.
    pub show_script_errors: bool,
}

/// Session cookie settings for an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Cookie name.
    pub cookie_name: String,
    /// Key used to sign session ids.
    pub auth_key: String,
    /// Key used to encrypt cookie payloads.
    pub encryption_key: String,
    /// Previous signing key, still accepted for verification.
    pub auth_key_rotate: String,
    /// Previous encryption key.
    pub encryption_key_rotate: String,
    /// Cookie `Domain`.
    pub domain: String,
    /// Cookie `Path`.
    pub path: String,
    /// Cookie `Max-Age` in seconds.
    pub max_age: i64,
    /// Cookie `Secure`.
    pub secure: bool,
    /// Cookie `HttpOnly`.
    pub http_only: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cookie_name: "switchyard_session".into(),
            auth_key: String::new(),
            encryption_key: String::new(),
            auth_key_rotate: String::new(),
            encryption_key_rotate: String::new(),
            domain: String::new(),
            path: "/".into(),
            max_age: 30 * 24 * 60 * 60,
            secure: false,
            http_only: true,
        }
    }
}

/// A named backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    /// Unique name; calls refer to it.
    pub name: String,
    /// Backend type.
    #[serde(rename = "type")]
    pub kind: BackendKind,
    /// Connection data shared by all environments.
    #[serde(default)]
    pub data: Value,
    /// Per-environment overrides, deep-merged over `data`.
    #[serde(default)]
    pub environment_data: BTreeMap<String, Value>,
}

/// A configured request-handling pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyEndpointDefinition {
    /// Unique id.
    pub id: String,
    /// Display name; jobs refer to endpoints by this name.
    pub name: String,
    /// Definition version. A new version triggers recompilation.
    #[serde(default = "default_version")]
    pub version: u64,
    /// Inactive endpoints are not routed.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Owning API name.
    pub api: String,
    /// Environment name.
    pub environment: String,
    /// Answer preflight requests and tag responses with CORS headers.
    pub cors_enabled: bool,
    /// Routes that select this endpoint.
    pub routes: Vec<RouteSpec>,
    /// Pipeline steps, in execution order.
    pub components: Vec<Component>,
}

impl Default for ProxyEndpointDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            version: default_version(),
            active: true,
            api: String::new(),
            environment: String::new(),
            cors_enabled: false,
            routes: Vec::new(),
            components: Vec::new(),
        }
    }
}

/// A route predicate set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSpec {
    /// Optional route name, for logs.
    pub name: Option<String>,
    /// Accepted methods. Empty accepts any method.
    pub methods: Vec<String>,
    /// Path template, with `{name}` or `{name:regex}` placeholders.
    pub path: String,
    /// Treat `path` as a prefix.
    pub prefix: bool,
    /// Host template. Falls back to the API hosts when absent.
    pub host: Option<String>,
    /// Accepted schemes. Empty accepts any scheme.
    pub schemes: Vec<String>,
    /// Header name to value template. An empty template only requires presence.
    pub headers: BTreeMap<String, String>,
    /// Query key to value template. An empty template only requires presence.
    pub queries: BTreeMap<String, String>,
}

/// How a component produces its effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// One backend call.
    #[default]
    Single,
    /// Several backend calls dispatched as one fan-out step.
    Multi,
    /// A script step with no backend call.
    Js,
}

/// One pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    /// Step kind. Ignored when `shared_component` is set.
    #[serde(rename = "type", default)]
    pub kind: ComponentKind,
    /// Use a shared component definition instead of the fields below.
    #[serde(default)]
    pub shared_component: Option<String>,
    /// Guard expression. Empty means always run.
    #[serde(default)]
    pub conditional: Option<String>,
    /// Run when the guard evaluates to this value.
    #[serde(default = "default_true")]
    pub conditional_positive: bool,
    /// Transformations applied before the step.
    #[serde(default)]
    pub before: Vec<Transformation>,
    /// Transformations applied after the step.
    #[serde(default)]
    pub after: Vec<Transformation>,
    /// The call of a single component.
    #[serde(default)]
    pub call: Option<CallSpec>,
    /// The calls of a multi component.
    #[serde(default)]
    pub calls: Vec<CallSpec>,
    /// Script body of a js component.
    #[serde(default)]
    pub script: Option<String>,
}

impl Default for Component {
    fn default() -> Self {
        Self {
            kind: ComponentKind::Single,
            shared_component: None,
            conditional: None,
            conditional_positive: true,
            before: Vec::new(),
            after: Vec::new(),
            call: None,
            calls: Vec::new(),
            script: None,
        }
    }
}

/// A reusable component definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedComponentDefinition {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// The component body.
    #[serde(flatten)]
    pub component: Component,
}

/// A backend call within a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSpec {
    /// Remote endpoint name.
    pub remote_endpoint: String,
    /// Script variable bound to the call object. Defaults to the endpoint name.
    #[serde(default)]
    pub name: Option<String>,
    /// Per-call guard.
    #[serde(default)]
    pub conditional: Option<String>,
    /// Issue the call when the guard evaluates to this value.
    #[serde(default = "default_true")]
    pub conditional_positive: bool,
    /// Transformations run before the request is collected.
    #[serde(default)]
    pub before: Vec<Transformation>,
    /// Transformations run after the response is stored.
    #[serde(default)]
    pub after: Vec<Transformation>,
}

impl CallSpec {
    /// Call targeting `remote_endpoint` with default settings.
    pub fn new(remote_endpoint: impl Into<String>) -> Self {
        Self {
            remote_endpoint: remote_endpoint.into(),
            name: None,
            conditional: None,
            conditional_positive: true,
            before: Vec::new(),
            after: Vec::new(),
        }
    }
}

/// A data transformation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformation {
    /// Transformation language. Only `js` is supported.
    #[serde(rename = "type", default = "Transformation::default_kind")]
    pub kind: String,
    /// Transformation body.
    pub data: String,
}

impl Transformation {
    fn default_kind() -> String {
        "js".into()
    }

    /// A script transformation.
    pub fn js(data: impl Into<String>) -> Self {
        Self {
            kind: Self::default_kind(),
            data: data.into(),
        }
    }
}

/// Builder for constructing catalogs in code.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    catalog: Catalog,
}

impl CatalogBuilder {
    /// Add an API.
    pub fn api(mut self, api: Api) -> Self {
        self.catalog.apis.push(api);
        self
    }

    /// Add an environment.
    pub fn environment(mut self, env: Environment) -> Self {
        self.catalog.environments.push(env);
        self
    }

    /// Add a remote endpoint.
    pub fn remote_endpoint(mut self, endpoint: RemoteEndpoint) -> Self {
        self.catalog.remote_endpoints.push(endpoint);
        self
    }

    /// Add a shared component.
    pub fn shared_component(mut self, shared: SharedComponentDefinition) -> Self {
        self.catalog.shared_components.push(shared);
        self
    }

    /// Add a proxy endpoint.
    pub fn proxy_endpoint(mut self, endpoint: ProxyEndpointDefinition) -> Self {
        self.catalog.proxy_endpoints.push(endpoint);
        self
    }

    /// Finish building.
    pub fn build(self) -> Catalog {
        self.catalog
    }
}
