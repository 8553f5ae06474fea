use serde::Deserialize;
use url::Url;

use crate::error::{RegistryError, Result};
use crate::models::Tags;

const ENDPOINT_VAR: &str = "FEATURE_REGISTRY_ENDPOINT";
const PROJECT_VAR: &str = "FEATURE_REGISTRY_PROJECT";
const SANDBOX_VAR: &str = "FEATURE_REGISTRY_SANDBOX";
const PROJECT_TAGS_VAR: &str = "FEATURE_REGISTRY_PROJECT_TAGS";

/// Where and as which project a client registers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryConfig {
    /// Base API URL, e.g. `https://registry.example.com/api/v1`.
    pub endpoint: String,
    pub project_name: String,
    #[serde(default)]
    pub project_tags: Tags,
    /// Sandbox registries take no auth headers.
    #[serde(default)]
    pub sandbox: bool,
}

impl RegistryConfig {
    /// Unchecked; [`RegistryClient::register_features`](crate::RegistryClient::register_features)
    /// runs [`validate`](Self::validate) before its first call.
    pub fn new(endpoint: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            project_name: project_name.into(),
            project_tags: Tags::new(),
            sandbox: false,
        }
    }

    pub fn with_project_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.project_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|err| RegistryError::Config {
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let missing = |name: &str| RegistryError::Config {
            reason: format!("missing {name}"),
        };

        let endpoint = get(ENDPOINT_VAR).ok_or_else(|| missing(ENDPOINT_VAR))?;
        let project_name = get(PROJECT_VAR).ok_or_else(|| missing(PROJECT_VAR))?;
        let sandbox = get(SANDBOX_VAR)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let project_tags = match get(PROJECT_TAGS_VAR) {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| RegistryError::Config {
                reason: format!("{PROJECT_TAGS_VAR}: {err}"),
            })?,
            None => Tags::new(),
        };

        let config = Self {
            endpoint,
            project_name,
            project_tags,
            sandbox,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would produce ambiguous qualified names.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(RegistryError::Config {
                reason: "endpoint must not be empty".into(),
            });
        }
        if self.project_name.trim().is_empty() {
            return Err(RegistryError::Config {
                reason: "project name must not be empty".into(),
            });
        }
        // `__` separates qualified-name segments
        if self.project_name.contains("__") {
            return Err(RegistryError::Config {
                reason: format!("project name `{}` must not contain `__`", self.project_name),
            });
        }
        Ok(())
    }

    /// Lineage UI page for the configured project, served from the
    /// endpoint's origin.
    pub fn lineage_url(&self) -> String {
        let origin = match Url::parse(&self.endpoint) {
            Ok(url) if url.has_host() => url.origin().ascii_serialization(),
            _ => self
                .endpoint
                .splitn(4, '/')
                .take(3)
                .collect::<Vec<_>>()
                .join("/"),
        };
        format!("{origin}/projects/{}/lineage", self.project_name)
    }
}
