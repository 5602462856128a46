//! Manifest composition.
//!
//! The builder validates the active provider and plugins, asks the provider
//! for cluster access, collects plugin fragments in declaration order and
//! merges them into an ordered [`Manifest`].

mod builder;
mod resource;

pub use builder::{ManifestBuilder, Prepared, Resolved};
pub use resource::{PRECEDENCE, Resource, ResourceKey, precedence};

use indexmap::IndexMap;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::{BerthError, Result};

/// Ordered, de-duplicated resources ready for application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    resources: Vec<Resource>,
}

impl Manifest {
    /// Merges resources in declaration order. A later resource with the same
    /// kind, namespace and name replaces the earlier one. The result is
    /// sorted by kind precedence; ties keep declaration order.
    #[must_use]
    pub fn from_resources(declared: impl IntoIterator<Item = Resource>) -> Self {
        let mut merged: IndexMap<ResourceKey, Resource> = IndexMap::new();
        for resource in declared {
            let key = resource.key();
            if merged.insert(key.clone(), resource).is_some() {
                debug!("Resource {key} redeclared, keeping the last declaration");
            }
        }

        let mut resources: Vec<Resource> = merged.into_values().collect();
        resources.sort_by_key(Resource::precedence);
        Self { resources }
    }

    /// All resources in apply order.
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the manifest has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Groups of consecutive resources with equal precedence. Resources in
    /// one tier do not depend on each other; a tier depends on all earlier
    /// tiers.
    #[must_use]
    pub fn tiers(&self) -> Vec<&[Resource]> {
        self.resources
            .chunk_by(|a, b| a.precedence() == b.precedence())
            .collect()
    }

    /// Looks up a resource by key.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&Resource> {
        self.resources.iter().find(|r| &r.key() == key)
    }

    /// Renders all resources as a multi-document YAML stream.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource cannot be serialized.
    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for resource in &self.resources {
            let doc = resource
                .to_yaml()
                .map_err(|e| BerthError::internal(format!("Failed to render {resource}: {e}")))?;
            out.push_str("---\n");
            out.push_str(&doc);
        }
        Ok(out)
    }

    /// SHA-256 of the rendered YAML.
    ///
    /// # Errors
    ///
    /// Same as [`Self::to_yaml`].
    pub fn digest(&self) -> Result<String> {
        Ok(ConfigHasher::hash_bytes(self.to_yaml()?.as_bytes()))
    }
}
