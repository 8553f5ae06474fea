use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::graph::{DerivedKey, FeatureKey, SourceKey};

/// Free-form registry tags. Ordered so encoded bodies are stable.
pub type Tags = BTreeMap<String, String>;

/// Name the passthrough source always carries.
pub const CONTEXT_SOURCE_NAME: &str = "PASSTHROUGH";

// ── Identity ────────────────────────────────────────────────────

/// Opaque identifier assigned by the registry at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryId(String);

impl RegistryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegistryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RegistryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Registration state of a catalog entity.
///
/// Entities start `Unregistered`; registration (or decode from the registry)
/// moves them to `Registered`, after which their definition is frozen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Registration {
    #[default]
    Unregistered,
    Registered {
        id: RegistryId,
        qualified_name: String,
    },
}

impl Registration {
    pub fn registered(id: RegistryId, qualified_name: impl Into<String>) -> Self {
        Self::Registered {
            id,
            qualified_name: qualified_name.into(),
        }
    }

    pub fn id(&self) -> Option<&RegistryId> {
        match self {
            Self::Registered { id, .. } => Some(id),
            Self::Unregistered => None,
        }
    }

    pub fn qualified_name(&self) -> Option<&str> {
        match self {
            Self::Registered { qualified_name, .. } => Some(qualified_name),
            Self::Unregistered => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered { .. })
    }
}

/// `{project}__{owner}__...__{name}`.
pub fn qualified_name(project: &str, chain: &[&str]) -> String {
    let mut out = String::from(project);
    for part in chain {
        out.push_str("__");
        out.push_str(part);
    }
    out
}

// ── Feature typing ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(rename = "UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "BOOLEAN")]
    Bool,
    #[serde(rename = "INT")]
    Int32,
    #[serde(rename = "LONG")]
    Int64,
    #[serde(rename = "FLOAT")]
    Float,
    #[serde(rename = "DOUBLE")]
    Double,
    #[serde(rename = "STRING")]
    String,
    #[serde(rename = "BYTES")]
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TensorCategory {
    Dense,
    Sparse,
}

/// Shape and value type of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureType {
    #[serde(rename = "type")]
    pub type_: String,
    pub tensor_category: TensorCategory,
    pub dimension_type: Vec<ValueType>,
    pub val_type: ValueType,
}

impl FeatureType {
    pub fn scalar(val_type: ValueType) -> Self {
        Self {
            type_: "TENSOR".into(),
            tensor_category: TensorCategory::Dense,
            dimension_type: Vec::new(),
            val_type,
        }
    }

    /// Dense one-dimensional vector indexed by `INT`.
    pub fn vector(val_type: ValueType) -> Self {
        Self {
            dimension_type: vec![ValueType::Int32],
            ..Self::scalar(val_type)
        }
    }
}

/// Entity key column a feature is joined on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedKey {
    pub key_column: String,
    pub key_column_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_column_alias: Option<String>,
}

impl TypedKey {
    pub fn new(key_column: impl Into<String>, key_column_type: ValueType) -> Self {
        Self {
            key_column: key_column.into(),
            key_column_type,
            full_name: None,
            description: None,
            key_column_alias: None,
        }
    }

    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.key_column_alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformation {
    /// Row-level expression over the source columns.
    Expression { transform_expr: String },
    /// Sliding-window aggregation.
    WindowAgg {
        def_expr: String,
        agg_func: Option<String>,
        window: Option<String>,
        group_by: Option<String>,
        filter: Option<String>,
        limit: Option<u64>,
    },
}

impl Transformation {
    pub fn expression(expr: impl Into<String>) -> Self {
        Self::Expression {
            transform_expr: expr.into(),
        }
    }

    pub fn window_agg(
        def_expr: impl Into<String>,
        agg_func: impl Into<String>,
        window: impl Into<String>,
    ) -> Self {
        Self::WindowAgg {
            def_expr: def_expr.into(),
            agg_func: Some(agg_func.into()),
            window: Some(window.into()),
            group_by: None,
            filter: None,
            limit: None,
        }
    }
}

// ── Source ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JdbcAuth {
    UserPass,
    Token,
}

impl JdbcAuth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserPass => "USERPASS",
            Self::Token => "TOKEN",
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v.to_ascii_uppercase().as_str() {
            "USERPASS" => Some(Self::UserPass),
            "TOKEN" => Some(Self::Token),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnowflakeTarget {
    Table(String),
    Query(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    /// Avro schema as a JSON string.
    pub schema: String,
}

/// Open-ended source read through a named connector format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenericSource {
    pub format: String,
    pub mode: Option<String>,
    pub options: BTreeMap<String, String>,
}

impl GenericSource {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Dots in option keys break the downstream HOCON config, so they are
    /// stored as `__`.
    pub fn with_option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options.insert(key.replace('.', "__"), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Request-time passthrough: features computed from the observation data.
    Context,
    Hdfs {
        path: String,
    },
    SparkSql {
        sql: Option<String>,
        table: Option<String>,
    },
    Jdbc {
        url: String,
        dbtable: Option<String>,
        query: Option<String>,
        auth: Option<JdbcAuth>,
    },
    MongoDb {
        url: String,
        pipeline: String,
    },
    Snowflake {
        database: String,
        schema: String,
        target: SnowflakeTarget,
    },
    Kafka(KafkaConfig),
    Generic(GenericSource),
}

impl SourceKind {
    /// Wire discriminator stored in the `type` attribute.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Context => CONTEXT_SOURCE_NAME,
            Self::Hdfs { .. } => "hdfs",
            Self::SparkSql { .. } => "sparksql",
            Self::Jdbc { .. } => "jdbc",
            Self::MongoDb { .. } => "mongodb",
            Self::Snowflake { .. } => "SNOWFLAKE",
            Self::Kafka(_) => "kafka",
            Self::Generic(_) => "generic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub kind: SourceKind,
    pub preprocessing: Option<String>,
    pub event_timestamp_column: Option<String>,
    pub timestamp_format: Option<String>,
    pub tags: Tags,
    pub registration: Registration,
}

impl Source {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            preprocessing: None,
            event_timestamp_column: None,
            timestamp_format: None,
            tags: Tags::new(),
            registration: Registration::Unregistered,
        }
    }

    pub fn context() -> Self {
        Self::new(CONTEXT_SOURCE_NAME, SourceKind::Context)
    }

    pub fn hdfs(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, SourceKind::Hdfs { path: path.into() })
    }

    pub fn is_context(&self) -> bool {
        matches!(self.kind, SourceKind::Context)
    }

    pub fn with_preprocessing(mut self, expr: impl Into<String>) -> Self {
        self.preprocessing = Some(expr.into());
        self
    }

    pub fn with_event_timestamp(
        mut self,
        column: impl Into<String>,
        format: impl Into<String>,
    ) -> Self {
        self.event_timestamp_column = Some(column.into());
        self.timestamp_format = Some(format.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

// ── Anchor ──────────────────────────────────────────────────────

/// A group of features computed from one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub name: String,
    pub source: SourceKey,
    pub features: Vec<FeatureKey>,
    pub tags: Tags,
    pub registration: Registration,
}

impl Anchor {
    pub fn new(name: impl Into<String>, source: SourceKey, features: Vec<FeatureKey>) -> Self {
        Self {
            name: name.into(),
            source,
            features,
            tags: Tags::new(),
            registration: Registration::Unregistered,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

// ── Feature ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub name: String,
    pub feature_type: FeatureType,
    pub keys: Vec<TypedKey>,
    pub transformation: Option<Transformation>,
    pub tags: Tags,
    pub registration: Registration,
}

impl Feature {
    pub fn new(name: impl Into<String>, feature_type: FeatureType, keys: Vec<TypedKey>) -> Self {
        Self {
            name: name.into(),
            feature_type,
            keys,
            transformation: None,
            tags: Tags::new(),
            registration: Registration::Unregistered,
        }
    }

    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformation = Some(transformation);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

// ── DerivedFeature ──────────────────────────────────────────────

/// Reference to an input of a derived feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureRef {
    Anchored(FeatureKey),
    Derived(DerivedKey),
}

impl FeatureRef {
    pub fn is_derived(&self) -> bool {
        matches!(self, Self::Derived(_))
    }
}

impl From<FeatureKey> for FeatureRef {
    fn from(key: FeatureKey) -> Self {
        Self::Anchored(key)
    }
}

impl From<DerivedKey> for FeatureRef {
    fn from(key: DerivedKey) -> Self {
        Self::Derived(key)
    }
}

/// A feature computed from other features rather than from a source.
///
/// Inputs are kept anchored-first: the registry stores anchored and derived
/// inputs as two separate lists, and a fetched feature gets them back in that
/// order, so positional indexing only survives a round trip in this layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedFeature {
    pub name: String,
    pub feature_type: FeatureType,
    pub keys: Vec<TypedKey>,
    inputs: Vec<FeatureRef>,
    pub transformation: Option<Transformation>,
    pub tags: Tags,
    pub registration: Registration,
}

impl DerivedFeature {
    pub fn new(
        name: impl Into<String>,
        feature_type: FeatureType,
        keys: Vec<TypedKey>,
        inputs: impl IntoIterator<Item = FeatureRef>,
    ) -> Self {
        let mut inputs: Vec<FeatureRef> = inputs.into_iter().collect();
        // stable: declared order is kept within each group
        inputs.sort_by_key(FeatureRef::is_derived);
        Self {
            name: name.into(),
            feature_type,
            keys,
            inputs,
            transformation: None,
            tags: Tags::new(),
            registration: Registration::Unregistered,
        }
    }

    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformation = Some(transformation);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn inputs(&self) -> &[FeatureRef] {
        &self.inputs
    }

    /// Derived-feature inputs only, in declared order.
    pub fn derived_inputs(&self) -> impl Iterator<Item = DerivedKey> + '_ {
        self.inputs.iter().filter_map(|input| match input {
            FeatureRef::Derived(key) => Some(*key),
            FeatureRef::Anchored(_) => None,
        })
    }

    pub(crate) fn push_input(&mut self, input: FeatureRef) {
        let at = if input.is_derived() {
            self.inputs.len()
        } else {
            self.inputs.partition_point(|i| !i.is_derived())
        };
        self.inputs.insert(at, input);
    }
}
