//! Catalog file loading.

use std::collections::HashSet;
use std::path::Path;

use switchyard_model::Catalog;

use crate::{expand_env_vars, ConfigError};

/// Serialization format of a catalog file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFormat {
    /// TOML document.
    Toml,
    /// JSON document.
    Json,
}

impl CatalogFormat {
    /// Pick the format from a file extension. Anything but `.json` is TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

/// Parse and check a catalog document.
pub fn parse_catalog(input: &str, format: CatalogFormat) -> Result<Catalog, ConfigError> {
    let expanded = expand_env_vars(input);
    let catalog: Catalog = match format {
        CatalogFormat::Toml => toml::from_str(&expanded)?,
        CatalogFormat::Json => serde_json::from_str(&expanded)?,
    };
    check_unique(&catalog)?;
    Ok(catalog)
}

/// Load a catalog file, choosing the format by extension.
pub fn load_catalog(path: &Path) -> Result<Catalog, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_catalog(&content, CatalogFormat::from_path(path))
}

/// Reject duplicate identifiers. Deeper checks belong to pipeline compilation.
fn check_unique(catalog: &Catalog) -> Result<(), ConfigError> {
    fn dupes<'a>(
        kind: &str,
        names: impl Iterator<Item = &'a str>,
    ) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                return Err(ConfigError::Invalid(format!("duplicate {kind} '{name}'")));
            }
        }
        Ok(())
    }

    dupes("api", catalog.apis.iter().map(|a| a.name.as_str()))?;
    dupes(
        "environment",
        catalog.environments.iter().map(|e| e.name.as_str()),
    )?;
    dupes(
        "remote endpoint",
        catalog.remote_endpoints.iter().map(|r| r.name.as_str()),
    )?;
    dupes(
        "shared component",
        catalog.shared_components.iter().map(|s| s.id.as_str()),
    )?;
    dupes(
        "proxy endpoint",
        catalog.proxy_endpoints.iter().map(|p| p.id.as_str()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML_CATALOG: &str = r#"
        [[apis]]
        name = "shop"

        [[environments]]
        name = "dev"
        values = { greeting = "hello" }

        [[remote_endpoints]]
        name = "users"
        type = "http"
        data = { url = "http://localhost:9000/users" }

        [[proxy_endpoints]]
        id = "1"
        name = "users"
        api = "shop"
        environment = "dev"

        [[proxy_endpoints.routes]]
        path = "/users"
        methods = ["GET"]

        [[proxy_endpoints.components]]
        type = "single"
        call = { remote_endpoint = "users" }
    "#;

    #[test]
    fn parses_toml_catalog() {
        let catalog = parse_catalog(TOML_CATALOG, CatalogFormat::Toml).unwrap();
        let pe = catalog.proxy_endpoint("1").unwrap();
        assert_eq!(pe.routes[0].path, "/users");
        assert_eq!(
            pe.components[0].call.as_ref().unwrap().remote_endpoint,
            "users"
        );
        assert_eq!(catalog.environment("dev").unwrap().values["greeting"], "hello");
    }

    #[test]
    fn parses_json_catalog() {
        let json = r#"{ "apis": [{ "name": "a" }], "proxy_endpoints": [] }"#;
        let catalog = parse_catalog(json, CatalogFormat::Json).unwrap();
        assert_eq!(catalog.apis.len(), 1);
    }

    #[test]
    fn rejects_duplicate_endpoint_ids() {
        let json = r#"{ "proxy_endpoints": [{ "id": "1" }, { "id": "1" }] }"#;
        let err = parse_catalog(json, CatalogFormat::Json).unwrap_err();
        assert!(err.to_string().contains("duplicate proxy endpoint '1'"));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(
            CatalogFormat::from_path(Path::new("c.JSON")),
            CatalogFormat::Json
        );
        assert_eq!(
            CatalogFormat::from_path(Path::new("c.toml")),
            CatalogFormat::Toml
        );
        assert_eq!(CatalogFormat::from_path(Path::new("c")), CatalogFormat::Toml);
    }

    #[test]
    fn loads_catalog_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(&path, TOML_CATALOG).unwrap();
        let catalog = load_catalog(&path).unwrap();
        assert_eq!(catalog.proxy_endpoints.len(), 1);
    }
}
