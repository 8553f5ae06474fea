//! In-process registry backend.
//!
//! Mirrors the SQL registry's storage model: one flat entity table keyed by
//! guid (qualified name, type, attribute bag) plus a directed edge table.
//! Used by tests and offline tooling in place of the HTTP service.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::error::TransportError;
use crate::models::wire::{Attributes, EntityRef};
use crate::models::{qualified_name, RegistryId, Relation, RelationshipType, TypeName, WireEntity};
use crate::session::{CreatedEntity, Headers, RegistrySession};

#[derive(Debug, Clone)]
struct StoredEntity {
    project: RegistryId,
    entity: WireEntity,
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entities: BTreeMap<RegistryId, StoredEntity>,
    relations: Vec<Relation>,
    bearer_token: Option<String>,
    fail_after: Option<usize>,
    create_calls: usize,
    creates_ok: usize,
}

fn generate_guid() -> Result<RegistryId, TransportError> {
    let mut buf = [0u8; 16];
    getrandom::getrandom(&mut buf)
        .map_err(|err| TransportError::new(500, format!("failed to generate id: {err}")))?;
    let hex = hex::encode(buf);
    Ok(RegistryId::new(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )))
}

fn bad_request(reason: impl Into<String>) -> TransportError {
    TransportError::new(400, reason)
}

fn required_str<'a>(body: &'a Attributes, key: &str) -> Result<&'a str, TransportError> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request(format!("missing `{key}`")))
}

/// Registry-side attribute layout stores the feature type under `type`.
fn store_feature_type(attrs: &mut Attributes) {
    if let Some(feature_type) = attrs.remove("featureType") {
        attrs.insert("type".into(), feature_type);
    }
}

fn guid_object(id: &RegistryId) -> Value {
    json!({ "guid": id })
}

/// Attribute equality for idempotent re-creates. An anchor's feature list
/// grows after creation and is not part of its definition.
fn same_definition(stored: &Attributes, incoming: &Attributes) -> bool {
    let strip = |attrs: &Attributes| {
        let mut attrs = attrs.clone();
        attrs.remove("features");
        attrs
    };
    strip(stored) == strip(incoming)
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject calls that lack `Authorization: Bearer <token>`.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Fail every create call once `successful` creates have gone through.
    pub fn fail_creates_after(&mut self, successful: Option<usize>) {
        self.fail_after = successful;
    }

    /// Create calls received, including rejected ones.
    pub fn create_calls(&self) -> usize {
        self.create_calls
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn entity(&self, id: &RegistryId) -> Option<&WireEntity> {
        self.entities.get(id).map(|stored| &stored.entity)
    }

    pub fn find_by_qualified_name(&self, qualified_name: &str) -> Option<&WireEntity> {
        self.entities
            .values()
            .map(|stored| &stored.entity)
            .find(|entity| entity.qualified_name() == Some(qualified_name))
    }

    /// Replace the attribute bag of an entity in place. Lets tests plant
    /// corrupt or legacy payloads.
    pub fn overwrite_attributes(&mut self, id: &RegistryId, attributes: Attributes) -> bool {
        match self.entities.get_mut(id) {
            Some(stored) => {
                stored.entity.attributes = attributes;
                true
            }
            None => false,
        }
    }

    fn authorize(&self, headers: &Headers) -> Result<(), TransportError> {
        let Some(token) = &self.bearer_token else {
            return Ok(());
        };
        let expected = format!("Bearer {token}");
        let authorized = headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("authorization") && *value == expected);
        if authorized {
            Ok(())
        } else {
            Err(TransportError::new(401, "unauthorized"))
        }
    }

    fn project(&self, project_id: &str) -> Result<(RegistryId, String), TransportError> {
        let id = RegistryId::new(project_id);
        match self.entities.get(&id) {
            Some(stored) if stored.entity.type_name == TypeName::Project => {
                let name = stored.entity.name().unwrap_or_default().to_string();
                Ok((id, name))
            }
            _ => Err(TransportError::not_found(format!("project {project_id}"))),
        }
    }

    fn project_by_name(&self, name: &str) -> Option<&RegistryId> {
        self.entities
            .iter()
            .find(|(_, stored)| {
                stored.entity.type_name == TypeName::Project && stored.entity.name() == Some(name)
            })
            .map(|(id, _)| id)
    }

    fn typed_in_project(
        &self,
        project: &RegistryId,
        id: &RegistryId,
        allowed: &[TypeName],
    ) -> Option<&WireEntity> {
        self.entities
            .get(id)
            .filter(|stored| &stored.project == project)
            .map(|stored| &stored.entity)
            .filter(|entity| allowed.contains(&entity.type_name))
    }

    /// Insert unless an entity with the same qualified name exists. Returns
    /// the id and whether a new entity was stored.
    fn insert(
        &mut self,
        project: &RegistryId,
        type_name: TypeName,
        qualified: String,
        mut attributes: Attributes,
    ) -> Result<(RegistryId, bool), TransportError> {
        attributes.insert("qualifiedName".into(), Value::String(qualified.clone()));

        if let Some(existing) = self.find_by_qualified_name(&qualified) {
            if existing.type_name == type_name && same_definition(&existing.attributes, &attributes)
            {
                return Ok((existing.guid.clone(), false));
            }
            return Err(TransportError::new(
                409,
                format!("entity `{qualified}` already exists with a different definition"),
            ));
        }

        let guid = generate_guid()?;
        let project = if type_name == TypeName::Project {
            guid.clone()
        } else {
            project.clone()
        };
        self.entities.insert(
            guid.clone(),
            StoredEntity {
                project,
                entity: WireEntity {
                    guid: guid.clone(),
                    type_name,
                    attributes,
                },
            },
        );
        Ok((guid, true))
    }

    fn link(&mut self, from: &RegistryId, to: &RegistryId, kind: RelationshipType) {
        let relation = Relation {
            from_entity_id: from.clone(),
            to_entity_id: to.clone(),
            relationship_type: kind,
        };
        if !self.relations.contains(&relation) {
            self.relations.push(relation);
        }
    }

    fn contain(&mut self, parent: &RegistryId, child: &RegistryId) {
        self.link(parent, child, RelationshipType::Contains);
        self.link(child, parent, RelationshipType::BelongsTo);
    }

    fn consume(&mut self, consumer: &RegistryId, producer: &RegistryId) {
        self.link(consumer, producer, RelationshipType::Consumes);
        self.link(producer, consumer, RelationshipType::Produces);
    }

    fn create_project(&mut self, body: &Attributes) -> Result<RegistryId, TransportError> {
        let name = required_str(body, "name")?.to_string();
        if let Some(id) = self.project_by_name(&name) {
            return Ok(id.clone());
        }
        let mut attributes = Attributes::new();
        attributes.insert("name".into(), Value::String(name.clone()));
        attributes.insert(
            "tags".into(),
            body.get("tags").cloned().unwrap_or_else(|| json!({})),
        );
        let placeholder = RegistryId::new("");
        let (id, _) = self.insert(&placeholder, TypeName::Project, name, attributes)?;
        Ok(id)
    }

    fn create_source(
        &mut self,
        project_id: &str,
        body: &Attributes,
    ) -> Result<RegistryId, TransportError> {
        let (project, project_name) = self.project(project_id)?;
        let name = required_str(body, "name")?;
        let qualified = qualified_name(&project_name, &[name]);
        let (id, created) = self.insert(&project, TypeName::Source, qualified, body.clone())?;
        if created {
            self.contain(&project, &id);
        }
        Ok(id)
    }

    fn create_anchor(
        &mut self,
        project_id: &str,
        body: &Attributes,
    ) -> Result<RegistryId, TransportError> {
        let (project, project_name) = self.project(project_id)?;
        let name = required_str(body, "name")?.to_string();
        let source = RegistryId::new(required_str(body, "sourceId")?);
        if self
            .typed_in_project(&project, &source, &[TypeName::Source])
            .is_none()
        {
            return Err(bad_request(format!("unknown source {source}")));
        }

        let mut attributes = Attributes::new();
        attributes.insert("name".into(), Value::String(name.clone()));
        attributes.insert("source".into(), guid_object(&source));
        attributes.insert("features".into(), json!([]));
        attributes.insert(
            "tags".into(),
            body.get("tags").cloned().unwrap_or_else(|| json!({})),
        );

        let qualified = qualified_name(&project_name, &[name.as_str()]);
        let (id, created) = self.insert(&project, TypeName::Anchor, qualified, attributes)?;
        if created {
            self.contain(&project, &id);
            self.consume(&id, &source);
        }
        Ok(id)
    }

    fn create_anchor_feature(
        &mut self,
        project_id: &str,
        anchor_id: &str,
        body: &Attributes,
    ) -> Result<RegistryId, TransportError> {
        let (project, project_name) = self.project(project_id)?;
        let anchor = RegistryId::new(anchor_id);
        let anchor_name = self
            .typed_in_project(&project, &anchor, &[TypeName::Anchor])
            .and_then(WireEntity::name)
            .ok_or_else(|| TransportError::not_found(format!("anchor {anchor_id}")))?
            .to_string();
        let name = required_str(body, "name")?;

        let mut attributes = body.clone();
        store_feature_type(&mut attributes);
        let qualified = qualified_name(&project_name, &[anchor_name.as_str(), name]);
        let (id, created) =
            self.insert(&project, TypeName::AnchorFeature, qualified, attributes)?;

        if let Some(stored) = self.entities.get_mut(&anchor) {
            let features = stored
                .entity
                .attributes
                .entry("features")
                .or_insert_with(|| json!([]));
            if let Value::Array(items) = features {
                let entry = guid_object(&id);
                if !items.contains(&entry) {
                    items.push(entry);
                }
            }
        }
        if created {
            self.contain(&anchor, &id);
        }
        Ok(id)
    }

    fn resolve_inputs(
        &self,
        project: &RegistryId,
        body: &Attributes,
        key: &str,
        allowed: TypeName,
    ) -> Result<Vec<RegistryId>, TransportError> {
        let refs: Vec<EntityRef> = match body.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|err| bad_request(format!("invalid `{key}`: {err}")))?,
            None => Vec::new(),
        };
        refs.into_iter()
            .map(EntityRef::into_id)
            .map(|id| match self.typed_in_project(project, &id, &[allowed]) {
                Some(_) => Ok(id),
                None => Err(bad_request(format!("unknown input feature {id}"))),
            })
            .collect()
    }

    fn create_derived(
        &mut self,
        project_id: &str,
        body: &Attributes,
    ) -> Result<RegistryId, TransportError> {
        let (project, project_name) = self.project(project_id)?;
        let name = required_str(body, "name")?;
        let anchor_inputs =
            self.resolve_inputs(&project, body, "inputAnchorFeatures", TypeName::AnchorFeature)?;
        let derived_inputs = self.resolve_inputs(
            &project,
            body,
            "inputDerivedFeatures",
            TypeName::DerivedFeature,
        )?;

        let mut attributes = body.clone();
        store_feature_type(&mut attributes);
        attributes.insert(
            "inputAnchorFeatures".into(),
            Value::Array(anchor_inputs.iter().map(guid_object).collect()),
        );
        attributes.insert(
            "inputDerivedFeatures".into(),
            Value::Array(derived_inputs.iter().map(guid_object).collect()),
        );

        let qualified = qualified_name(&project_name, &[name]);
        let (id, created) =
            self.insert(&project, TypeName::DerivedFeature, qualified, attributes)?;
        if created {
            self.contain(&project, &id);
            for input in anchor_inputs.iter().chain(&derived_inputs) {
                self.consume(&id, input);
            }
        }
        Ok(id)
    }

    fn project_payload(&self, name: &str) -> Result<Value, TransportError> {
        let project = self
            .project_by_name(name)
            .ok_or_else(|| TransportError::not_found(format!("project {name}")))?;
        let entities: BTreeMap<&RegistryId, &WireEntity> = self
            .entities
            .iter()
            .filter(|(_, stored)| &stored.project == project)
            .map(|(id, stored)| (id, &stored.entity))
            .collect();
        let relations: Vec<&Relation> = self
            .relations
            .iter()
            .filter(|r| {
                entities.contains_key(&r.from_entity_id) && entities.contains_key(&r.to_entity_id)
            })
            .collect();
        Ok(json!({ "guidEntityMap": entities, "relations": relations }))
    }

    fn project_features(&self, name: &str) -> Result<Value, TransportError> {
        let project = self
            .project_by_name(name)
            .ok_or_else(|| TransportError::not_found(format!("project {name}")))?;
        let features: Vec<&WireEntity> = self
            .entities
            .values()
            .filter(|stored| &stored.project == project)
            .map(|stored| &stored.entity)
            .filter(|entity| {
                matches!(
                    entity.type_name,
                    TypeName::AnchorFeature | TypeName::DerivedFeature
                )
            })
            .collect();
        Ok(json!(features))
    }

    /// Entities directly downstream of `id`: contained children and consumers.
    fn dependents(&self, id: &RegistryId) -> Vec<&WireEntity> {
        self.relations
            .iter()
            .filter(|r| {
                &r.from_entity_id == id
                    && matches!(
                        r.relationship_type,
                        RelationshipType::Contains | RelationshipType::Produces
                    )
            })
            .filter_map(|r| self.entity(&r.to_entity_id))
            .collect()
    }

    fn remove(&mut self, id: &RegistryId) {
        self.entities.remove(id);
        self.relations
            .retain(|r| &r.from_entity_id != id && &r.to_entity_id != id);
        let reference = guid_object(id);
        for stored in self.entities.values_mut() {
            if let Some(Value::Array(features)) = stored.entity.attributes.get_mut("features") {
                features.retain(|f| f != &reference);
            }
        }
    }
}

impl RegistrySession for MemoryRegistry {
    fn create_entity(
        &mut self,
        path: &[&str],
        body: &Value,
        headers: &Headers,
    ) -> Result<CreatedEntity, TransportError> {
        self.authorize(headers)?;
        self.create_calls += 1;
        if self.fail_after.is_some_and(|limit| self.creates_ok >= limit) {
            return Err(TransportError::new(500, "injected create failure"));
        }
        let body = body
            .as_object()
            .ok_or_else(|| bad_request("request body must be a JSON object"))?;

        let guid = match path {
            ["projects"] => self.create_project(body)?,
            ["projects", project, "datasources"] => self.create_source(project, body)?,
            ["projects", project, "anchors"] => self.create_anchor(project, body)?,
            ["projects", project, "anchors", anchor, "features"] => {
                self.create_anchor_feature(project, anchor, body)?
            }
            ["projects", project, "derivedfeatures"] => self.create_derived(project, body)?,
            _ => return Err(TransportError::not_found(path.join("/"))),
        };
        self.creates_ok += 1;
        tracing::trace!(path = %path.join("/"), %guid, "memory registry create");

        let attributes = self
            .entity(&guid)
            .map(|entity| Value::Object(entity.attributes.clone()))
            .unwrap_or(Value::Null);
        Ok(CreatedEntity { guid, attributes })
    }

    fn read_entity(&self, path: &[&str], headers: &Headers) -> Result<Value, TransportError> {
        self.authorize(headers)?;
        match path {
            ["projects", name] => self.project_payload(name),
            ["projects", name, "features"] => self.project_features(name),
            ["dependent", qualified] => {
                let entity = self
                    .find_by_qualified_name(qualified)
                    .ok_or_else(|| TransportError::not_found(*qualified))?;
                Ok(json!(self.dependents(&entity.guid)))
            }
            _ => Err(TransportError::not_found(path.join("/"))),
        }
    }

    fn delete_entity(&mut self, path: &[&str], headers: &Headers) -> Result<Value, TransportError> {
        self.authorize(headers)?;
        let ["entity", qualified] = path else {
            return Err(TransportError::not_found(path.join("/")));
        };
        let id = self
            .find_by_qualified_name(qualified)
            .map(|entity| entity.guid.clone())
            .ok_or_else(|| TransportError::not_found(*qualified))?;
        if !self.dependents(&id).is_empty() {
            return Err(bad_request(format!(
                "entity `{qualified}` has dependent entities"
            )));
        }
        self.remove(&id);
        Ok(json!({ "guid": id }))
    }
}
