//! Feature-definition catalog client.
//!
//! Registers a graph of sources, anchors, features and derived features with
//! a feature registry and rebuilds that graph from the registry's flat
//! project payload.
//!
//! ```no_run
//! use feature_registry::{
//!     Anchor, FeatureGraph, MemoryRegistry, RegistryClient, RegistryConfig, Source,
//! };
//!
//! let mut graph = FeatureGraph::new();
//! let trips = graph.add_source(Source::hdfs("trips", "abfss://taxi/trips.csv"));
//! graph.add_anchor(Anchor::new("trip_features", trips, Vec::new()));
//!
//! let config = RegistryConfig::new("http://localhost:8000/api/v1", "taxi");
//! let mut client = RegistryClient::new(config, MemoryRegistry::new());
//! client.register_features(&mut graph)?;
//! let fetched = client.fetch_project("taxi")?;
//! assert_eq!(fetched.anchor_count(), 1);
//! # Ok::<(), feature_registry::RegistryError>(())
//! ```

mod client;
mod config;
mod decoder;
mod encoder;
mod error;
mod memory;
pub mod models;
mod sequencer;
mod session;

pub use client::RegistryClient;
pub use config::RegistryConfig;
pub use decoder::{decode_project, decode_project_value};
pub use encoder::{GraphEncoder, RegistrationSummary};
pub use error::{RegistryError, Result, TransportError};
pub use memory::MemoryRegistry;
pub use models::{
    qualified_name, Anchor, AnchorKey, DerivedFeature, DerivedKey, Feature, FeatureGraph,
    FeatureKey, FeatureRef, FeatureType, GenericSource, JdbcAuth, KafkaConfig, Registration,
    RegistryId, SnowflakeTarget, Source, SourceKey, SourceKind, Tags, Transformation, TypedKey,
    ValueType,
};
pub use sequencer::registration_order;
pub use session::{bearer, AuthProvider, CreatedEntity, Headers, RegistrySession};
