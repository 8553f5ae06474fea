use serde_json::Value;

use crate::config::RegistryConfig;
use crate::decoder::decode_project_value;
use crate::encoder::{GraphEncoder, RegistrationSummary};
use crate::error::{RegistryError, Result};
use crate::models::{EntitySummary, FeatureGraph, WireEntity};
use crate::session::{AuthProvider, Headers, RegistrySession};

/// Catalog client: a config, a session and an optional auth provider.
pub struct RegistryClient<S> {
    config: RegistryConfig,
    session: S,
    auth: Option<AuthProvider>,
}

fn summaries(value: Value, what: &str) -> Result<Vec<EntitySummary>> {
    let entities: Vec<WireEntity> =
        serde_json::from_value(value).map_err(|source| RegistryError::MalformedEntity {
            entity: what.to_string(),
            source,
        })?;
    entities.iter().map(EntitySummary::from_entity).collect()
}

impl<S: RegistrySession> RegistryClient<S> {
    pub fn new(config: RegistryConfig, session: S) -> Self {
        Self {
            config,
            session,
            auth: None,
        }
    }

    /// Attach auth headers to every call. Ignored for sandbox registries.
    pub fn with_auth(mut self, auth: AuthProvider) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    fn auth(&self) -> Option<&AuthProvider> {
        if self.config.sandbox {
            None
        } else {
            self.auth.as_ref()
        }
    }

    fn headers(&self) -> Headers {
        self.auth().map(|provider| provider()).unwrap_or_default()
    }

    /// Register every anchor and derived feature of `graph` under the
    /// configured project, writing ids back onto the graph.
    #[tracing::instrument(skip_all, fields(project = %self.config.project_name))]
    pub fn register_features(&mut self, graph: &mut FeatureGraph) -> Result<RegistrationSummary> {
        self.config.validate()?;
        let auth = if self.config.sandbox {
            None
        } else {
            self.auth.as_ref()
        };
        let summary = GraphEncoder::new(
            &mut self.session,
            &self.config.project_name,
            &self.config.project_tags,
        )
        .with_auth(auth)
        .register(graph)?;

        tracing::info!(
            created = summary.created,
            skipped = summary.skipped,
            project_id = %summary.project_id,
            "registered features"
        );
        tracing::info!(lineage = %self.config.lineage_url(), "lineage available");
        Ok(summary)
    }

    /// Fetch a project and rebuild its live graph.
    #[tracing::instrument(skip(self))]
    pub fn fetch_project(&self, project_name: &str) -> Result<FeatureGraph> {
        let value = self
            .session
            .read_entity(&["projects", project_name], &self.headers())?;
        decode_project_value(value)
    }

    pub fn list_registered_features(&self, project_name: &str) -> Result<Vec<EntitySummary>> {
        let value = self
            .session
            .read_entity(&["projects", project_name, "features"], &self.headers())?;
        summaries(value, project_name)
    }

    /// Entities directly downstream of `qualified_name`.
    pub fn list_dependent_entities(&self, qualified_name: &str) -> Result<Vec<EntitySummary>> {
        let value = self
            .session
            .read_entity(&["dependent", qualified_name], &self.headers())?;
        summaries(value, qualified_name)
    }

    /// Delete an entity. The registry refuses while dependents exist.
    pub fn delete_entity(&mut self, qualified_name: &str) -> Result<()> {
        let headers = self.headers();
        self.session
            .delete_entity(&["entity", qualified_name], &headers)?;
        tracing::info!(%qualified_name, "deleted entity");
        Ok(())
    }

    pub fn lineage_url(&self) -> String {
        self.config.lineage_url()
    }
}
