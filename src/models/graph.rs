use crate::error::{RegistryError, Result};

use super::entities::{Anchor, DerivedFeature, Feature, FeatureRef, Source};
use super::wire::Relation;

macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}

arena_key!(
    /// Handle to a [`Source`] in a [`FeatureGraph`].
    SourceKey
);
arena_key!(
    /// Handle to an [`Anchor`] in a [`FeatureGraph`].
    AnchorKey
);
arena_key!(
    /// Handle to an anchored [`Feature`] in a [`FeatureGraph`].
    FeatureKey
);
arena_key!(
    /// Handle to a [`DerivedFeature`] in a [`FeatureGraph`].
    DerivedKey
);

/// Live catalog object graph.
///
/// Entities are stored in per-kind arenas and refer to each other by key, so
/// two anchors sharing a source hold the same [`SourceKey`]. Keys are only
/// meaningful for the graph that handed them out; indexing with a foreign key
/// panics like an out-of-bounds slice index.
#[derive(Debug, Clone, Default)]
pub struct FeatureGraph {
    sources: Vec<Source>,
    anchors: Vec<Anchor>,
    features: Vec<Feature>,
    derived: Vec<DerivedFeature>,
    relations: Vec<Relation>,
}

impl FeatureGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, source: Source) -> SourceKey {
        self.sources.push(source);
        SourceKey(self.sources.len() - 1)
    }

    pub fn add_feature(&mut self, feature: Feature) -> FeatureKey {
        self.features.push(feature);
        FeatureKey(self.features.len() - 1)
    }

    pub fn add_anchor(&mut self, anchor: Anchor) -> AnchorKey {
        self.anchors.push(anchor);
        AnchorKey(self.anchors.len() - 1)
    }

    pub fn add_derived(&mut self, derived: DerivedFeature) -> DerivedKey {
        self.derived.push(derived);
        DerivedKey(self.derived.len() - 1)
    }

    /// Append an input to a derived feature that has not been registered yet.
    pub fn add_input(&mut self, derived: DerivedKey, input: FeatureRef) -> Result<()> {
        let feature = &mut self.derived[derived.0];
        if feature.registration.is_registered() {
            return Err(RegistryError::AlreadyRegistered {
                entity: feature.name.clone(),
            });
        }
        feature.push_input(input);
        Ok(())
    }

    pub fn source(&self, key: SourceKey) -> &Source {
        &self.sources[key.0]
    }

    pub fn anchor(&self, key: AnchorKey) -> &Anchor {
        &self.anchors[key.0]
    }

    pub fn feature(&self, key: FeatureKey) -> &Feature {
        &self.features[key.0]
    }

    pub fn derived(&self, key: DerivedKey) -> &DerivedFeature {
        &self.derived[key.0]
    }

    pub(crate) fn source_mut(&mut self, key: SourceKey) -> &mut Source {
        &mut self.sources[key.0]
    }

    pub(crate) fn anchor_mut(&mut self, key: AnchorKey) -> &mut Anchor {
        &mut self.anchors[key.0]
    }

    pub(crate) fn feature_mut(&mut self, key: FeatureKey) -> &mut Feature {
        &mut self.features[key.0]
    }

    pub(crate) fn derived_mut(&mut self, key: DerivedKey) -> &mut DerivedFeature {
        &mut self.derived[key.0]
    }

    pub fn anchor_keys(&self) -> impl Iterator<Item = AnchorKey> {
        (0..self.anchors.len()).map(AnchorKey)
    }

    pub fn derived_keys(&self) -> impl Iterator<Item = DerivedKey> {
        (0..self.derived.len()).map(DerivedKey)
    }

    pub fn anchors(&self) -> impl Iterator<Item = (AnchorKey, &Anchor)> {
        self.anchors.iter().enumerate().map(|(i, a)| (AnchorKey(i), a))
    }

    pub fn derived_features(&self) -> impl Iterator<Item = (DerivedKey, &DerivedFeature)> {
        self.derived
            .iter()
            .enumerate()
            .map(|(i, d)| (DerivedKey(i), d))
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    pub fn derived_count(&self) -> usize {
        self.derived.len()
    }

    pub fn find_anchor(&self, name: &str) -> Option<AnchorKey> {
        self.anchors
            .iter()
            .position(|a| a.name == name)
            .map(AnchorKey)
    }

    pub fn find_derived(&self, name: &str) -> Option<DerivedKey> {
        self.derived
            .iter()
            .position(|d| d.name == name)
            .map(DerivedKey)
    }

    /// The anchor listing `feature`, if any.
    pub fn owning_anchor(&self, feature: FeatureKey) -> Option<AnchorKey> {
        self.anchors
            .iter()
            .position(|a| a.features.contains(&feature))
            .map(AnchorKey)
    }

    /// Display name of a derived-feature input.
    pub fn input_name(&self, input: FeatureRef) -> &str {
        match input {
            FeatureRef::Anchored(key) => &self.feature(key).name,
            FeatureRef::Derived(key) => &self.derived(key).name,
        }
    }

    /// Relations returned alongside a fetched project. Informational only;
    /// links are resolved from entity attributes.
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub(crate) fn set_relations(&mut self, relations: Vec<Relation>) {
        self.relations = relations;
    }
}
