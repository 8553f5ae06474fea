//! Rebuild a live [`FeatureGraph`] from a registry project payload.
//!
//! Decoding runs in two passes. The first turns every entity into a detached
//! record that still refers to its neighbours by [`RegistryId`]; the second
//! allocates arena entries and resolves those ids, so an entity referenced
//! from several places ends up as a single key.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{RegistryError, Result};
use crate::models::wire::{decode_anchor, decode_derived, decode_feature, decode_source};
use crate::models::{
    Anchor, DerivedKey, FeatureGraph, FeatureKey, FeatureRef, ProjectPayload, Registration,
    RegistryId, SourceKey, TypeName, WireEntity,
};
use crate::sequencer::registration_order;

/// Parse and decode the body of `GET projects/{name}`.
pub fn decode_project_value(value: Value) -> Result<FeatureGraph> {
    let payload: ProjectPayload =
        serde_json::from_value(value).map_err(|source| RegistryError::MalformedEntity {
            entity: "project payload".to_string(),
            source,
        })?;
    decode_project(payload)
}

fn registration(entity: &WireEntity) -> Result<Registration> {
    let qualified = entity
        .qualified_name()
        .ok_or_else(|| RegistryError::MalformedEntity {
            entity: entity.guid.to_string(),
            source: serde::de::Error::missing_field("qualifiedName"),
        })?;
    Ok(Registration::registered(entity.guid.clone(), qualified))
}

fn dangling(missing: &RegistryId, referenced_by: &RegistryId) -> RegistryError {
    RegistryError::DanglingReference {
        missing: missing.clone(),
        referenced_by: referenced_by.to_string(),
    }
}

pub fn decode_project(payload: ProjectPayload) -> Result<FeatureGraph> {
    let mut graph = FeatureGraph::new();
    let mut sources: HashMap<RegistryId, SourceKey> = HashMap::new();
    let mut features: HashMap<RegistryId, FeatureKey> = HashMap::new();
    let mut derived: HashMap<RegistryId, DerivedKey> = HashMap::new();
    let mut anchors = Vec::new();
    let mut pending_inputs = Vec::new();

    for (id, entity) in &payload.guid_entity_map {
        let guid = id.as_str();
        match entity.type_name {
            TypeName::Project => {}
            TypeName::Source => {
                let mut source = decode_source(&entity.attributes, guid)?;
                source.registration = registration(entity)?;
                sources.insert(id.clone(), graph.add_source(source));
            }
            TypeName::AnchorFeature => {
                let mut feature = decode_feature(&entity.attributes, guid)?;
                feature.registration = registration(entity)?;
                features.insert(id.clone(), graph.add_feature(feature));
            }
            TypeName::DerivedFeature => {
                let mut detached = decode_derived(&entity.attributes, guid)?;
                detached.feature.registration = registration(entity)?;
                let key = graph.add_derived(detached.feature);
                derived.insert(id.clone(), key);
                pending_inputs.push((id, key, detached.anchor_inputs, detached.derived_inputs));
            }
            TypeName::Anchor => {
                let detached = decode_anchor(&entity.attributes, guid)?;
                anchors.push((id, registration(entity)?, detached));
            }
        }
    }

    for (id, registration, detached) in anchors {
        let source_id = detached.source.id();
        let source = *sources
            .get(source_id)
            .ok_or_else(|| dangling(source_id, id))?;
        let keys = detached
            .features
            .iter()
            .map(|feature| {
                features
                    .get(feature.id())
                    .copied()
                    .ok_or_else(|| dangling(feature.id(), id))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut anchor = Anchor::new(detached.name, source, keys);
        anchor.tags = detached.tags.unwrap_or_default();
        anchor.registration = registration;
        graph.add_anchor(anchor);
    }

    for (id, key, anchor_inputs, derived_inputs) in pending_inputs {
        for input in &anchor_inputs {
            let feature = *features.get(input).ok_or_else(|| dangling(input, id))?;
            graph.derived_mut(key).push_input(FeatureRef::Anchored(feature));
        }
        for input in &derived_inputs {
            let upstream = *derived.get(input).ok_or_else(|| dangling(input, id))?;
            graph.derived_mut(key).push_input(FeatureRef::Derived(upstream));
        }
    }

    // a registry that stores a derived cycle is corrupt; refuse to hand it out
    registration_order(&graph, graph.derived_keys().collect::<Vec<_>>())?;

    graph.set_relations(payload.relations);
    tracing::debug!(
        anchors = graph.anchor_count(),
        derived = graph.derived_count(),
        "decoded project"
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::models::{SourceKind, Transformation, ValueType};

    fn feature_attrs(name: &str, qualified: &str) -> Value {
        json!({
            "name": name,
            "qualifiedName": qualified,
            "type": {"type": "TENSOR", "tensorCategory": "DENSE", "dimensionType": [], "valType": "FLOAT"},
            "key": [{"keyColumn": "DOLocationID", "keyColumnType": "INT"}],
            "transformation": {"transformExpr": name},
            "tags": {}
        })
    }

    fn shared_source_payload() -> Value {
        json!({
            "guidEntityMap": {
                "p": {"guid": "p", "typeName": "feathr_workspace_v1", "attributes": {"name": "taxi", "qualifiedName": "taxi"}},
                "S": {"guid": "S", "typeName": "feathr_source_v1", "attributes": {
                    "name": "trips", "qualifiedName": "taxi__trips", "type": "hdfs", "path": "/data/trips.csv"
                }},
                "A": {"guid": "A", "typeName": "feathr_anchor_v1", "attributes": {
                    "name": "trip_features", "qualifiedName": "taxi__trip_features",
                    "source": {"guid": "S"}, "features": [{"guid": "F1"}]
                }},
                "B": {"guid": "B", "typeName": "feathr_anchor_v1", "attributes": {
                    "name": "more_trip_features", "qualifiedName": "taxi__more_trip_features",
                    "source": {"guid": "S"}, "features": []
                }},
                "F1": {"guid": "F1", "typeName": "feathr_anchor_feature_v1",
                    "attributes": feature_attrs("f_trip_distance", "taxi__trip_features__f_trip_distance")},
                "D1": {"guid": "D1", "typeName": "feathr_derived_feature_v1", "attributes": {
                    "name": "f_double_distance", "qualifiedName": "taxi__f_double_distance",
                    "type": {"type": "TENSOR", "tensorCategory": "DENSE", "dimensionType": [], "valType": "FLOAT"},
                    "key": [],
                    "inputAnchorFeatures": [{"guid": "F1"}],
                    "inputDerivedFeatures": [],
                    "transformation": {"transformExpr": "f_trip_distance * 2"}
                }},
                "D2": {"guid": "D2", "typeName": "feathr_derived_feature_v1", "attributes": {
                    "name": "f_quad_distance", "qualifiedName": "taxi__f_quad_distance",
                    "type": {"type": "TENSOR", "tensorCategory": "DENSE", "dimensionType": [], "valType": "FLOAT"},
                    "key": [],
                    "inputAnchorFeatures": [],
                    "inputDerivedFeatures": [{"guid": "D1"}],
                    "transformation": {"transformExpr": "f_double_distance * 2"}
                }}
            },
            "relations": []
        })
    }

    #[test]
    fn shared_entities_decode_to_one_key() {
        let graph = decode_project_value(shared_source_payload()).unwrap();
        let a = graph.anchor(graph.find_anchor("trip_features").unwrap());
        let b = graph.anchor(graph.find_anchor("more_trip_features").unwrap());
        assert_eq!(a.source, b.source);
        assert_eq!(
            graph.source(a.source).kind,
            SourceKind::Hdfs {
                path: "/data/trips.csv".into()
            }
        );

        let d1 = graph.find_derived("f_double_distance").unwrap();
        assert_eq!(graph.derived(d1).inputs(), &[FeatureRef::Anchored(a.features[0])]);
        let d2 = graph.find_derived("f_quad_distance").unwrap();
        assert_eq!(graph.derived(d2).inputs(), &[FeatureRef::Derived(d1)]);
    }

    #[test]
    fn decoded_entities_carry_registration() {
        let graph = decode_project_value(shared_source_payload()).unwrap();
        let a = graph.anchor(graph.find_anchor("trip_features").unwrap());
        let feature = graph.feature(a.features[0]);
        assert_eq!(
            feature.registration,
            Registration::registered(RegistryId::new("F1"), "taxi__trip_features__f_trip_distance")
        );
        assert_eq!(feature.keys[0].key_column_type, ValueType::Int32);
        assert_eq!(
            feature.transformation,
            Some(Transformation::expression("f_trip_distance"))
        );
    }

    #[test]
    fn missing_feature_is_dangling() {
        let mut payload = shared_source_payload();
        payload["guidEntityMap"]["A"]["attributes"]["features"] = json!([{"guid": "F1"}, {"guid": "F9"}]);
        let err = decode_project_value(payload).unwrap_err();
        assert!(
            matches!(err, RegistryError::DanglingReference { ref missing, ref referenced_by }
                if missing.as_str() == "F9" && referenced_by == "A"),
            "{err:?}"
        );
    }

    #[test]
    fn missing_source_is_dangling() {
        let mut payload = shared_source_payload();
        payload["guidEntityMap"]
            .as_object_mut()
            .unwrap()
            .remove("S");
        assert!(matches!(
            decode_project_value(payload),
            Err(RegistryError::DanglingReference { .. })
        ));
    }

    #[test]
    fn missing_derived_input_is_dangling() {
        let mut payload = shared_source_payload();
        payload["guidEntityMap"]["D2"]["attributes"]["inputDerivedFeatures"] = json!(["D7"]);
        let err = decode_project_value(payload).unwrap_err();
        assert!(
            matches!(err, RegistryError::DanglingReference { ref referenced_by, .. } if referenced_by == "D2")
        );
    }

    #[test]
    fn stored_cycle_is_rejected() {
        let mut payload = shared_source_payload();
        payload["guidEntityMap"]["D1"]["attributes"]["inputDerivedFeatures"] = json!([{"guid": "D2"}]);
        assert!(matches!(
            decode_project_value(payload),
            Err(RegistryError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn unknown_type_name_is_malformed() {
        let mut payload = shared_source_payload();
        payload["guidEntityMap"]["S"]["typeName"] = json!("feathr_table_v9");
        assert!(matches!(
            decode_project_value(payload),
            Err(RegistryError::MalformedEntity { .. })
        ));
    }

    #[test]
    fn entity_without_qualified_name_is_malformed() {
        let mut payload = shared_source_payload();
        payload["guidEntityMap"]["S"]["attributes"]
            .as_object_mut()
            .unwrap()
            .remove("qualifiedName");
        let err = decode_project_value(payload).unwrap_err();
        assert!(matches!(err, RegistryError::MalformedEntity { ref entity, .. } if entity == "S"));
    }

    #[test]
    fn relations_are_kept() {
        let mut payload = shared_source_payload();
        payload["relations"] = json!([
            {"fromEntityId": "A", "toEntityId": "S", "relationshipType": "Consumes"}
        ]);
        let graph = decode_project_value(payload).unwrap();
        assert_eq!(graph.relations().len(), 1);
    }
}
