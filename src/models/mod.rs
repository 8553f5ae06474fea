//! Catalog entity model.
//!
//! Entities: Source, Anchor, Feature, DerivedFeature.
//! Relationships: containment (project/anchor owns children) and data
//! dependency (consumer consumes producer), carried as registry ids in the
//! flat wire form and as arena keys in a live [`FeatureGraph`].

mod casing;
mod entities;
mod graph;
pub mod wire;

pub use casing::{camelize_keys, to_camel_case};
pub use entities::*;
pub use graph::*;
pub use wire::{EntitySummary, ProjectPayload, Relation, RelationshipType, TypeName, WireEntity};
