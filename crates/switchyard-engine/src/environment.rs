//! Environment resolver.
//!
//! Pipeline-visible values come from the environment's value map. Driver
//! connection data for a remote endpoint is the endpoint's base data with the
//! environment's override deep-merged on top. Anything missing resolves to
//! "not configured" rather than a default.

use std::sync::Arc;

use serde_json::Value;
use switchyard_drivers::{ConnectionResolver, ResolvedEndpoint};
use switchyard_model::Catalog;
use switchyard_sandbox::{EnvironmentAccessor, Resolution};

/// Resolves environment values and connection data against a catalog.
#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    catalog: Arc<Catalog>,
}

impl EnvironmentResolver {
    /// Resolver over `catalog`.
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// A pipeline-visible value of `environment`.
    pub fn resolve(&self, environment: &str, name: &str) -> Resolution {
        self.catalog
            .environment(environment)
            .and_then(|env| env.values.get(name))
            .map(|v| Resolution::Value(v.clone()))
            .unwrap_or(Resolution::NotConfigured)
    }

    /// Connection data of `remote_endpoint` for `environment`.
    pub fn resolve_for_endpoint(
        &self,
        environment: &str,
        remote_endpoint: &str,
    ) -> Option<ResolvedEndpoint> {
        let endpoint = self.catalog.remote_endpoint(remote_endpoint)?;
        let mut connection = match &endpoint.data {
            Value::Null => Value::Object(Default::default()),
            data => data.clone(),
        };
        if let Some(overlay) = endpoint.environment_data.get(environment) {
            deep_merge(&mut connection, overlay);
        }
        Some(ResolvedEndpoint {
            kind: endpoint.kind,
            connection,
        })
    }

    /// Accessor bound to one environment, handed to a Sandbox Session and
    /// its call dispatcher.
    pub fn scoped(&self, environment: &str) -> Arc<ScopedEnvironment> {
        Arc::new(ScopedEnvironment {
            resolver: self.clone(),
            environment: environment.to_string(),
        })
    }
}

/// An [`EnvironmentResolver`] bound to one environment.
#[derive(Debug)]
pub struct ScopedEnvironment {
    resolver: EnvironmentResolver,
    environment: String,
}

impl EnvironmentAccessor for ScopedEnvironment {
    fn name(&self) -> &str {
        &self.environment
    }

    fn resolve(&self, name: &str) -> Resolution {
        self.resolver.resolve(&self.environment, name)
    }
}

impl ConnectionResolver for ScopedEnvironment {
    fn resolve_endpoint(&self, name: &str) -> Option<ResolvedEndpoint> {
        self.resolver.resolve_for_endpoint(&self.environment, name)
    }
}

/// Merge `overlay` into `base`. Objects merge key by key; any other value
/// in `overlay` replaces what is in `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_model::{BackendKind, Environment, RemoteEndpoint};

    fn resolver() -> EnvironmentResolver {
        let catalog = Catalog::builder()
            .environment(Environment {
                name: "dev".into(),
                values: json!({ "region": "eu", "limits": { "max": 3 } })
                    .as_object()
                    .cloned()
                    .unwrap(),
                ..Default::default()
            })
            .environment(Environment {
                name: "prod".into(),
                ..Default::default()
            })
            .remote_endpoint(RemoteEndpoint {
                name: "db".into(),
                kind: BackendKind::Postgres,
                data: json!({ "config": { "host": "localhost", "port": 5432 }, "pool": 4 }),
                environment_data: [("prod".to_string(), json!({ "config": { "host": "db.prod" } }))]
                    .into_iter()
                    .collect(),
            })
            .build();
        EnvironmentResolver::new(Arc::new(catalog))
    }

    #[test]
    fn resolves_values_per_environment() {
        let r = resolver();
        assert_eq!(r.resolve("dev", "region"), Resolution::Value(json!("eu")));
        assert_eq!(r.resolve("dev", "limits"), Resolution::Value(json!({ "max": 3 })));
        assert_eq!(r.resolve("prod", "region"), Resolution::NotConfigured);
        assert_eq!(r.resolve("staging", "region"), Resolution::NotConfigured);
    }

    #[test]
    fn endpoint_data_is_deep_merged() {
        let r = resolver();
        let prod = r.resolve_for_endpoint("prod", "db").unwrap();
        assert_eq!(prod.kind, BackendKind::Postgres);
        assert_eq!(
            prod.connection,
            json!({ "config": { "host": "db.prod", "port": 5432 }, "pool": 4 })
        );
        let dev = r.resolve_for_endpoint("dev", "db").unwrap();
        assert_eq!(dev.connection["config"]["host"], "localhost");
        assert!(r.resolve_for_endpoint("dev", "cache").is_none());
    }

    #[test]
    fn scoped_accessor_is_bound_to_its_environment() {
        let scoped = resolver().scoped("dev");
        assert_eq!(scoped.name(), "dev");
        assert_eq!(
            EnvironmentAccessor::resolve(scoped.as_ref(), "region"),
            Resolution::Value(json!("eu"))
        );
        assert!(scoped.resolve_endpoint("db").is_some());
    }

    #[test]
    fn merge_replaces_non_objects() {
        let mut base = json!({ "a": [1, 2], "b": { "c": 1 } });
        deep_merge(&mut base, &json!({ "a": [3], "b": 5 }));
        assert_eq!(base, json!({ "a": [3], "b": 5 }));
    }
}
