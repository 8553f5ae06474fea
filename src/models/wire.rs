//! Flat registry representation of catalog entities.
//!
//! Every entity travels as `{guid, typeName, attributes}`. Attribute bags are
//! produced by the `encode_*` functions and read back by the `decode_*`
//! functions; references between entities inside a bag are registry ids, so
//! decoding an anchor or derived feature yields a detached record that the
//! graph decoder links afterwards.

use std::collections::BTreeMap;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::form_urlencoded;

use super::casing::camelize_keys;
use super::entities::{
    DerivedFeature, Feature, FeatureType, GenericSource, JdbcAuth, KafkaConfig, RegistryId,
    SnowflakeTarget, Source, SourceKind, Tags, Transformation, TypedKey, CONTEXT_SOURCE_NAME,
};
use crate::error::{RegistryError, Result};

pub type Attributes = Map<String, Value>;

/// Keys of a generic source's attribute bag that are registry metadata, not
/// connector options.
pub const GENERIC_RESERVED_KEYS: [&str; 9] = [
    "type",
    "name",
    "format",
    "mode",
    "qualifiedName",
    "preprocessing",
    "eventTimestampColumn",
    "timestampFormat",
    "tags",
];

const SNOWFLAKE_PREFIX: &str = "snowflake://snowflake_account/?";

// ── Envelope ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeName {
    #[serde(rename = "feathr_workspace_v1")]
    Project,
    #[serde(rename = "feathr_source_v1")]
    Source,
    #[serde(rename = "feathr_anchor_v1")]
    Anchor,
    #[serde(rename = "feathr_anchor_feature_v1")]
    AnchorFeature,
    #[serde(rename = "feathr_derived_feature_v1")]
    DerivedFeature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntity {
    pub guid: RegistryId,
    pub type_name: TypeName,
    pub attributes: Attributes,
}

impl WireEntity {
    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name").and_then(Value::as_str)
    }

    pub fn qualified_name(&self) -> Option<&str> {
        self.attributes.get("qualifiedName").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipType {
    Contains,
    BelongsTo,
    Consumes,
    Produces,
}

/// Directed registry edge. Only the registry creates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub from_entity_id: RegistryId,
    pub to_entity_id: RegistryId,
    pub relationship_type: RelationshipType,
}

/// Everything the registry knows about one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPayload {
    pub guid_entity_map: BTreeMap<RegistryId, WireEntity>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

/// Reference to another entity inside an attribute bag: either the bare id
/// (as sent on create) or `{"guid": ...}` (as returned on read).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Id(RegistryId),
    Object { guid: RegistryId },
}

impl EntityRef {
    pub fn id(&self) -> &RegistryId {
        match self {
            Self::Id(id) | Self::Object { guid: id } => id,
        }
    }

    pub fn into_id(self) -> RegistryId {
        match self {
            Self::Id(id) | Self::Object { guid: id } => id,
        }
    }
}

/// Row returned by the listing endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
    pub name: String,
    pub id: RegistryId,
    pub qualified_name: String,
}

impl EntitySummary {
    pub fn from_entity(entity: &WireEntity) -> Result<Self> {
        let missing = |field: &str| RegistryError::MalformedEntity {
            entity: entity.guid.to_string(),
            source: serde_json::Error::custom(format!("missing field `{field}`")),
        };
        Ok(Self {
            name: entity.name().ok_or_else(|| missing("name"))?.to_string(),
            id: entity.guid.clone(),
            qualified_name: entity
                .qualified_name()
                .ok_or_else(|| missing("qualifiedName"))?
                .to_string(),
        })
    }
}

fn parse<T: DeserializeOwned>(value: Value, entity: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|source| RegistryError::MalformedEntity {
        entity: entity.to_string(),
        source,
    })
}

fn malformed(entity: &str, reason: impl std::fmt::Display) -> RegistryError {
    RegistryError::MalformedEntity {
        entity: entity.to_string(),
        source: serde_json::Error::custom(reason),
    }
}

fn put_opt(attrs: &mut Attributes, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        attrs.insert(key.into(), Value::String(v.clone()));
    }
}

fn tags_value(tags: &Tags) -> Value {
    Value::Object(
        tags.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

// ── Source ──────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceCommon {
    name: String,
    #[serde(default)]
    preprocessing: Option<String>,
    #[serde(default)]
    event_timestamp_column: Option<String>,
    #[serde(default)]
    timestamp_format: Option<String>,
    #[serde(default)]
    tags: Option<Tags>,
}

#[derive(Deserialize)]
struct HdfsAttributes {
    path: String,
}

#[derive(Deserialize)]
struct SparkSqlAttributes {
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    table: Option<String>,
}

#[derive(Deserialize)]
struct JdbcAttributes {
    #[serde(default)]
    url: String,
    #[serde(default)]
    dbtable: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    auth: Option<String>,
}

#[derive(Deserialize)]
struct MongoDbAttributes {
    #[serde(default)]
    url: String,
    pipeline: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KafkaAttributes {
    #[serde(default)]
    brokers: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    schema_str: String,
}

#[derive(Deserialize)]
struct GenericAttributes {
    format: String,
    #[serde(default)]
    mode: Option<String>,
}

pub fn snowflake_path(database: &str, schema: &str, target: &SnowflakeTarget) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("sfDatabase", database)
        .append_pair("sfSchema", schema);
    match target {
        SnowflakeTarget::Table(table) => query.append_pair("dbtable", table),
        SnowflakeTarget::Query(sql) => query.append_pair("query", sql),
    };
    format!("{SNOWFLAKE_PREFIX}{}", query.finish())
}

fn parse_snowflake_path(path: &str, entity: &str) -> Result<SourceKind> {
    let query = path
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| malformed(entity, format!("snowflake path without parameters: {path}")))?;
    let params: BTreeMap<String, String> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let required = |key: &str| {
        params
            .get(key)
            .cloned()
            .ok_or_else(|| malformed(entity, format!("snowflake path is missing `{key}`")))
    };
    let target = match (params.get("dbtable"), params.get("query")) {
        (Some(table), None) => SnowflakeTarget::Table(table.clone()),
        (None, Some(sql)) => SnowflakeTarget::Query(sql.clone()),
        _ => {
            return Err(malformed(
                entity,
                "snowflake path needs exactly one of `dbtable` or `query`",
            ))
        }
    };
    Ok(SourceKind::Snowflake {
        database: required("sfDatabase")?,
        schema: required("sfSchema")?,
        target,
    })
}

/// Attribute bag for a source create call.
///
/// Generic options share the bag with the source attributes, so an option
/// named like one of [`GENERIC_RESERVED_KEYS`] is rejected.
pub fn encode_source(source: &Source) -> Result<Attributes> {
    let mut attrs = Attributes::new();
    if let SourceKind::Generic(generic) = &source.kind {
        for (key, value) in &generic.options {
            if GENERIC_RESERVED_KEYS.contains(&key.as_str()) {
                return Err(RegistryError::ReservedOptionKey {
                    entity: source.name.clone(),
                    key: key.clone(),
                });
            }
            attrs.insert(key.clone(), Value::String(value.clone()));
        }
    }
    attrs.insert("name".into(), Value::String(source.name.clone()));
    attrs.insert("type".into(), Value::String(source.kind.type_name().into()));

    match &source.kind {
        SourceKind::Context => {}
        SourceKind::Hdfs { path } => {
            attrs.insert("path".into(), Value::String(path.clone()));
        }
        SourceKind::SparkSql { sql, table } => {
            put_opt(&mut attrs, "sql", sql);
            put_opt(&mut attrs, "table", table);
        }
        SourceKind::Jdbc {
            url,
            dbtable,
            query,
            auth,
        } => {
            attrs.insert("url".into(), Value::String(url.clone()));
            put_opt(&mut attrs, "dbtable", dbtable);
            put_opt(&mut attrs, "query", query);
            if let Some(auth) = auth {
                attrs.insert("auth".into(), Value::String(auth.as_str().into()));
            }
        }
        SourceKind::MongoDb { url, pipeline } => {
            attrs.insert("url".into(), Value::String(url.clone()));
            attrs.insert("pipeline".into(), Value::String(pipeline.clone()));
        }
        SourceKind::Snowflake {
            database,
            schema,
            target,
        } => {
            attrs.insert(
                "path".into(),
                Value::String(snowflake_path(database, schema, target)),
            );
        }
        SourceKind::Kafka(config) => {
            attrs.insert("brokers".into(), serde_json::json!(config.brokers));
            attrs.insert("topics".into(), serde_json::json!(config.topics));
            attrs.insert("schemaStr".into(), Value::String(config.schema.clone()));
        }
        SourceKind::Generic(generic) => {
            attrs.insert("format".into(), Value::String(generic.format.clone()));
            if let Some(mode) = generic.mode.as_ref().filter(|m| !m.is_empty()) {
                attrs.insert("mode".into(), Value::String(mode.clone()));
            }
        }
    }

    if !source.is_context() {
        put_opt(&mut attrs, "preprocessing", &source.preprocessing);
        put_opt(&mut attrs, "eventTimestampColumn", &source.event_timestamp_column);
        put_opt(&mut attrs, "timestampFormat", &source.timestamp_format);
    }
    attrs.insert("tags".into(), tags_value(&source.tags));
    Ok(attrs)
}

/// Rebuild a source from its attribute bag, dispatching on `type`.
///
/// Source keys are not camel-cased: generic connector options are free-form
/// and must come back exactly as stored.
pub fn decode_source(attrs: &Attributes, entity: &str) -> Result<Source> {
    let value = Value::Object(attrs.clone());
    let kind_tag = attrs.get("type").and_then(Value::as_str);

    let kind = match kind_tag {
        Some(CONTEXT_SOURCE_NAME) => {
            let tags: Option<Tags> = match attrs.get("tags") {
                Some(tags) => parse(tags.clone(), entity)?,
                None => None,
            };
            let name = attrs
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(CONTEXT_SOURCE_NAME);
            let mut source = Source::new(name, SourceKind::Context);
            source.tags = tags.unwrap_or_default();
            return Ok(source);
        }
        Some("hdfs") => {
            let HdfsAttributes { path } = parse(value.clone(), entity)?;
            SourceKind::Hdfs { path }
        }
        Some("sparksql") => {
            let SparkSqlAttributes { sql, table } = parse(value.clone(), entity)?;
            SourceKind::SparkSql { sql, table }
        }
        Some("jdbc") => {
            let jdbc: JdbcAttributes = parse(value.clone(), entity)?;
            let auth = match jdbc.auth.as_deref() {
                None | Some("") => None,
                Some(raw) => Some(
                    JdbcAuth::parse(raw)
                        .ok_or_else(|| malformed(entity, format!("invalid jdbc auth `{raw}`")))?,
                ),
            };
            SourceKind::Jdbc {
                url: jdbc.url,
                dbtable: jdbc.dbtable,
                query: jdbc.query,
                auth,
            }
        }
        Some("mongodb") => {
            let MongoDbAttributes { url, pipeline } = parse(value.clone(), entity)?;
            SourceKind::MongoDb { url, pipeline }
        }
        Some("SNOWFLAKE") => {
            let HdfsAttributes { path } = parse(value.clone(), entity)?;
            parse_snowflake_path(&path, entity)?
        }
        Some("kafka") => {
            let kafka: KafkaAttributes = parse(value.clone(), entity)?;
            SourceKind::Kafka(KafkaConfig {
                brokers: kafka.brokers,
                topics: kafka.topics,
                schema: kafka.schema_str,
            })
        }
        Some("generic") => {
            let GenericAttributes { format, mode } = parse(value.clone(), entity)?;
            let options = attrs
                .iter()
                .filter(|(key, _)| !GENERIC_RESERVED_KEYS.contains(&key.as_str()))
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), value)
                })
                .collect();
            SourceKind::Generic(GenericSource {
                format,
                mode: mode.filter(|m| !m.is_empty()),
                options,
            })
        }
        // sources registered before the `hdfs` tag existed carry only a path
        None if attrs.contains_key("path") => {
            let HdfsAttributes { path } = parse(value.clone(), entity)?;
            SourceKind::Hdfs { path }
        }
        other => {
            return Err(RegistryError::UnknownSourceKind {
                kind: other.unwrap_or_default().to_string(),
                entity: entity.to_string(),
            })
        }
    };

    let common: SourceCommon = parse(value, entity)?;
    Ok(Source {
        name: common.name,
        kind,
        preprocessing: common.preprocessing,
        event_timestamp_column: common.event_timestamp_column,
        timestamp_format: common.timestamp_format,
        tags: common.tags.unwrap_or_default(),
        registration: Default::default(),
    })
}

// ── Transformation ──────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowAggAttributes {
    def_expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agg_func: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
}

pub fn encode_transformation(transformation: &Transformation) -> Value {
    match transformation {
        Transformation::Expression { transform_expr } => {
            serde_json::json!({ "transformExpr": transform_expr })
        }
        Transformation::WindowAgg {
            def_expr,
            agg_func,
            window,
            group_by,
            filter,
            limit,
        } => {
            let attrs = WindowAggAttributes {
                def_expr: def_expr.clone(),
                agg_func: agg_func.clone(),
                window: window.clone(),
                group_by: group_by.clone(),
                filter: filter.clone(),
                limit: *limit,
            };
            // plain struct of strings and integers
            serde_json::to_value(attrs).unwrap_or(Value::Null)
        }
    }
}

/// `None` for an absent or null transformation. The shape is recognized by
/// its defining key: `transformExpr` or `defExpr`.
pub fn decode_transformation(value: Option<&Value>, entity: &str) -> Result<Option<Transformation>> {
    let value = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(v) => camelize_keys(v.clone()),
    };
    if let Some(expr) = value.get("transformExpr") {
        let transform_expr = expr
            .as_str()
            .ok_or_else(|| malformed(entity, "`transformExpr` must be a string"))?;
        return Ok(Some(Transformation::expression(transform_expr)));
    }
    if value.get("defExpr").is_some() {
        let agg: WindowAggAttributes = parse(value, entity)?;
        return Ok(Some(Transformation::WindowAgg {
            def_expr: agg.def_expr,
            agg_func: agg.agg_func,
            window: agg.window,
            group_by: agg.group_by,
            filter: agg.filter,
            limit: agg.limit,
        }));
    }
    Err(RegistryError::UnknownTransformationShape {
        entity: entity.to_string(),
    })
}

// ── Anchor ──────────────────────────────────────────────────────

pub fn encode_anchor(name: &str, source_id: &RegistryId, tags: &Tags) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("name".into(), Value::String(name.into()));
    attrs.insert("sourceId".into(), Value::String(source_id.to_string()));
    attrs.insert("tags".into(), tags_value(tags));
    attrs
}

/// Anchor as stored in the registry, still holding ids instead of links.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DetachedAnchor {
    pub name: String,
    #[serde(alias = "sourceId")]
    pub source: EntityRef,
    #[serde(default)]
    pub features: Vec<EntityRef>,
    #[serde(default)]
    pub tags: Option<Tags>,
}

pub fn decode_anchor(attrs: &Attributes, entity: &str) -> Result<DetachedAnchor> {
    parse(Value::Object(attrs.clone()), entity)
}

// ── Feature ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FeatureAttributes {
    name: String,
    #[serde(rename = "type", alias = "featureType")]
    feature_type: FeatureType,
    #[serde(default)]
    key: Vec<TypedKey>,
    #[serde(default)]
    transformation: Option<Value>,
    #[serde(default)]
    tags: Option<Tags>,
}

fn encode_feature_common(
    attrs: &mut Attributes,
    name: &str,
    feature_type: &FeatureType,
    keys: &[TypedKey],
    transformation: &Option<Transformation>,
    tags: &Tags,
) {
    attrs.insert("name".into(), Value::String(name.into()));
    attrs.insert(
        "featureType".into(),
        serde_json::to_value(feature_type).unwrap_or(Value::Null),
    );
    attrs.insert(
        "key".into(),
        serde_json::to_value(keys).unwrap_or_else(|_| Value::Array(Vec::new())),
    );
    if let Some(transformation) = transformation {
        attrs.insert(
            "transformation".into(),
            encode_transformation(transformation),
        );
    }
    attrs.insert("tags".into(), tags_value(tags));
}

pub fn encode_feature(feature: &Feature) -> Attributes {
    let mut attrs = Attributes::new();
    encode_feature_common(
        &mut attrs,
        &feature.name,
        &feature.feature_type,
        &feature.keys,
        &feature.transformation,
        &feature.tags,
    );
    attrs
}

pub fn decode_feature(attrs: &Attributes, entity: &str) -> Result<Feature> {
    let parsed: FeatureAttributes = parse(camelize_keys(Value::Object(attrs.clone())), entity)?;
    Ok(Feature {
        name: parsed.name,
        feature_type: parsed.feature_type,
        keys: parsed.key,
        transformation: decode_transformation(parsed.transformation.as_ref(), entity)?,
        tags: parsed.tags.unwrap_or_default(),
        registration: Default::default(),
    })
}

// ── DerivedFeature ──────────────────────────────────────────────

/// Encode a derived feature whose inputs have already been resolved to ids,
/// anchored inputs first.
pub fn encode_derived(
    derived: &DerivedFeature,
    anchor_inputs: &[RegistryId],
    derived_inputs: &[RegistryId],
) -> Attributes {
    let mut attrs = Attributes::new();
    encode_feature_common(
        &mut attrs,
        &derived.name,
        &derived.feature_type,
        &derived.keys,
        &derived.transformation,
        &derived.tags,
    );
    attrs.insert(
        "inputAnchorFeatures".into(),
        serde_json::json!(anchor_inputs),
    );
    attrs.insert(
        "inputDerivedFeatures".into(),
        serde_json::json!(derived_inputs),
    );
    attrs
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DerivedInputs {
    #[serde(default)]
    input_anchor_features: Vec<EntityRef>,
    #[serde(default)]
    input_derived_features: Vec<EntityRef>,
}

/// Derived feature as stored in the registry: the definition without inputs
/// plus the two input id lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedDerived {
    pub feature: DerivedFeature,
    pub anchor_inputs: Vec<RegistryId>,
    pub derived_inputs: Vec<RegistryId>,
}

pub fn decode_derived(attrs: &Attributes, entity: &str) -> Result<DetachedDerived> {
    let value = camelize_keys(Value::Object(attrs.clone()));
    let parsed: FeatureAttributes = parse(value.clone(), entity)?;
    let inputs: DerivedInputs = parse(value, entity)?;

    let mut feature = DerivedFeature::new(parsed.name, parsed.feature_type, parsed.key, []);
    feature.transformation = decode_transformation(parsed.transformation.as_ref(), entity)?;
    feature.tags = parsed.tags.unwrap_or_default();

    Ok(DetachedDerived {
        feature,
        anchor_inputs: inputs
            .input_anchor_features
            .into_iter()
            .map(EntityRef::into_id)
            .collect(),
        derived_inputs: inputs
            .input_derived_features
            .into_iter()
            .map(EntityRef::into_id)
            .collect(),
    })
}
