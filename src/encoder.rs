//! Registration of a live feature graph.
//!
//! Order: project, then per anchor its source, the anchor and its features,
//! then derived features in dependency order. Each created id is written back
//! onto the entity immediately, so a failed run leaves everything created so
//! far marked as registered and a rerun resumes where it stopped.

use std::collections::HashSet;

use serde_json::Value;

use crate::error::{RegistryError, Result};
use crate::models::wire::{encode_anchor, encode_derived, encode_feature, encode_source, Attributes};
use crate::models::{
    qualified_name, AnchorKey, FeatureGraph, FeatureRef, Registration, RegistryId, Source,
    SourceKey, Tags,
};
use crate::sequencer::registration_order;
use crate::session::{AuthProvider, Headers, RegistrySession};

/// Outcome of one registration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSummary {
    pub project_id: RegistryId,
    /// Entities created by this run, excluding the project.
    pub created: usize,
    /// Entities that already carried an id and were left alone.
    pub skipped: usize,
}

pub struct GraphEncoder<'a, S: RegistrySession> {
    session: &'a mut S,
    project_name: &'a str,
    project_tags: &'a Tags,
    auth: Option<&'a AuthProvider>,
    created: usize,
    skipped: usize,
    /// Sources already handled this run; a shared source is counted once.
    seen_sources: HashSet<SourceKey>,
}

impl<'a, S: RegistrySession> GraphEncoder<'a, S> {
    pub fn new(session: &'a mut S, project_name: &'a str, project_tags: &'a Tags) -> Self {
        Self {
            session,
            project_name,
            project_tags,
            auth: None,
            created: 0,
            skipped: 0,
            seen_sources: HashSet::new(),
        }
    }

    pub fn with_auth(mut self, auth: Option<&'a AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    fn headers(&self) -> Headers {
        self.auth.map(|provider| provider()).unwrap_or_default()
    }

    fn create(&mut self, entity: &str, path: &[&str], body: Attributes) -> Result<RegistryId> {
        let body = Value::Object(body);
        tracing::debug!(path = %path.join("/"), %body, "registry create");
        let headers = self.headers();
        let created = self
            .session
            .create_entity(path, &body, &headers)
            .map_err(|source| RegistryError::RegistrationFailed {
                entity: entity.to_string(),
                source,
            })?;
        Ok(created.guid)
    }

    /// Register every anchor and derived feature in `graph`.
    pub fn register(mut self, graph: &mut FeatureGraph) -> Result<RegistrationSummary> {
        // everything that can fail locally fails before the first call
        let order = registration_order(graph, graph.derived_keys().collect::<Vec<_>>())?;
        check_inputs_resolvable(graph)?;
        for (_, anchor) in graph.anchors() {
            encode_source(graph.source(anchor.source))?;
        }

        let project_id = self.ensure_project()?;
        for anchor in graph.anchor_keys().collect::<Vec<_>>() {
            self.register_anchor(graph, &project_id, anchor)?;
        }

        for key in order {
            let derived = graph.derived(key);
            if derived.registration.is_registered() {
                self.skipped += 1;
                continue;
            }
            let name = derived.name.clone();
            let mut anchor_inputs = Vec::new();
            let mut derived_inputs = Vec::new();
            for input in derived.inputs() {
                let id = match input {
                    FeatureRef::Anchored(f) => graph.feature(*f).registration.id(),
                    FeatureRef::Derived(d) => graph.derived(*d).registration.id(),
                };
                let id = id.cloned().ok_or_else(|| RegistryError::UnresolvedInput {
                    derived: name.clone(),
                    input: graph.input_name(*input).to_string(),
                })?;
                if input.is_derived() {
                    derived_inputs.push(id);
                } else {
                    anchor_inputs.push(id);
                }
            }

            let body = encode_derived(derived, &anchor_inputs, &derived_inputs);
            let id = self.create(
                &name,
                &["projects", project_id.as_str(), "derivedfeatures"],
                body,
            )?;
            self.created += 1;
            graph.derived_mut(key).registration =
                Registration::registered(id, qualified_name(self.project_name, &[&name]));
        }

        Ok(RegistrationSummary {
            project_id,
            created: self.created,
            skipped: self.skipped,
        })
    }

    /// Create-if-absent: the registry hands back the existing id for a known
    /// project name.
    fn ensure_project(&mut self) -> Result<RegistryId> {
        let mut body = Attributes::new();
        body.insert("name".into(), Value::String(self.project_name.to_string()));
        body.insert(
            "tags".into(),
            Value::Object(
                self.project_tags
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        let name = self.project_name;
        self.create(name, &["projects"], body)
    }

    /// Id of `source` if it can be reused in this project.
    fn reusable_source_id(&self, source: &Source) -> Option<RegistryId> {
        match &source.registration {
            Registration::Unregistered => None,
            // The context source is one shared value across projects; an id
            // minted under another project must not leak into this lineage.
            Registration::Registered { qualified_name: qn, .. }
                if source.is_context()
                    && *qn != qualified_name(self.project_name, &[&source.name]) =>
            {
                None
            }
            Registration::Registered { id, .. } => Some(id.clone()),
        }
    }

    fn ensure_source(
        &mut self,
        graph: &mut FeatureGraph,
        project_id: &RegistryId,
        key: SourceKey,
    ) -> Result<RegistryId> {
        let first_visit = self.seen_sources.insert(key);
        let source = graph.source(key);
        if let Some(id) = self.reusable_source_id(source) {
            if first_visit {
                self.skipped += 1;
            }
            return Ok(id);
        }

        let name = source.name.clone();
        let body = encode_source(source)?;
        let id = self.create(
            &name,
            &["projects", project_id.as_str(), "datasources"],
            body,
        )?;
        self.created += 1;
        graph.source_mut(key).registration =
            Registration::registered(id.clone(), qualified_name(self.project_name, &[&name]));
        Ok(id)
    }

    fn register_anchor(
        &mut self,
        graph: &mut FeatureGraph,
        project_id: &RegistryId,
        key: AnchorKey,
    ) -> Result<()> {
        let source_key = graph.anchor(key).source;
        let source_id = self.ensure_source(graph, project_id, source_key)?;

        let anchor = graph.anchor(key);
        let anchor_name = anchor.name.clone();
        let anchor_id = match anchor.registration.id() {
            Some(id) => {
                self.skipped += 1;
                id.clone()
            }
            None => {
                let body = encode_anchor(&anchor_name, &source_id, &anchor.tags);
                let id = self.create(
                    &anchor_name,
                    &["projects", project_id.as_str(), "anchors"],
                    body,
                )?;
                self.created += 1;
                graph.anchor_mut(key).registration = Registration::registered(
                    id.clone(),
                    qualified_name(self.project_name, &[&anchor_name]),
                );
                id
            }
        };

        for feature_key in graph.anchor(key).features.clone() {
            let feature = graph.feature(feature_key);
            if feature.registration.is_registered() {
                self.skipped += 1;
                continue;
            }
            let name = feature.name.clone();
            let body = encode_feature(feature);
            let id = self.create(
                &name,
                &[
                    "projects",
                    project_id.as_str(),
                    "anchors",
                    anchor_id.as_str(),
                    "features",
                ],
                body,
            )?;
            self.created += 1;
            graph.feature_mut(feature_key).registration = Registration::registered(
                id,
                qualified_name(self.project_name, &[&anchor_name, &name]),
            );
        }
        Ok(())
    }
}

/// Every anchored input must either be registered already or belong to an
/// anchor that this run will register.
fn check_inputs_resolvable(graph: &FeatureGraph) -> Result<()> {
    for (_, derived) in graph.derived_features() {
        for input in derived.inputs() {
            if let FeatureRef::Anchored(feature) = input {
                let registered = graph.feature(*feature).registration.is_registered();
                if !registered && graph.owning_anchor(*feature).is_none() {
                    return Err(RegistryError::UnresolvedInput {
                        derived: derived.name.clone(),
                        input: graph.feature(*feature).name.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
