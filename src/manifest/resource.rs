//! Kubernetes resource definitions and their apply precedence.

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;

/// Apply order by kind. Kinds not listed come last.
pub const PRECEDENCE: &[&str] = &[
    "Namespace",
    "ServiceAccount",
    "Secret",
    "ConfigMap",
    "PersistentVolumeClaim",
    "Service",
    "StatefulSet",
    "Deployment",
    "Job",
    "CronJob",
    "Ingress",
];

/// Precedence rank of a kind; lower applies first.
#[must_use]
pub fn precedence(kind: &str) -> usize {
    PRECEDENCE
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(PRECEDENCE.len())
}

/// Identity of a resource within a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Resource kind.
    pub kind: String,
    /// Namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{ns}/{}", self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// One resource definition ready for `kubectl apply`.
///
/// `body` is the complete object. JSON objects keep their keys sorted, so
/// rendering is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// `apiVersion`.
    pub api_version: String,
    /// `kind`.
    pub kind: String,
    /// `metadata.name`.
    pub name: String,
    /// `metadata.namespace`.
    pub namespace: Option<String>,
    /// Full object.
    pub body: Value,
}

impl Resource {
    /// Creates a resource with only identity fields set.
    #[must_use]
    pub fn new(api_version: &str, kind: &str, name: &str, namespace: Option<&str>) -> Self {
        let mut metadata = Map::new();
        metadata.insert(String::from("name"), json!(name));
        if let Some(ns) = namespace {
            metadata.insert(String::from("namespace"), json!(ns));
        }

        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            body: json!({
                "apiVersion": api_version,
                "kind": kind,
                "metadata": metadata,
            }),
        }
    }

    /// Sets a top-level field such as `spec`, `data` or `type`. Identity
    /// fields cannot be overwritten this way.
    #[must_use]
    pub fn with(mut self, field: &str, value: Value) -> Self {
        if !matches!(field, "apiVersion" | "kind" | "metadata")
            && let Some(body) = self.body.as_object_mut()
        {
            body.insert(field.to_string(), value);
        }
        self
    }

    /// Adds labels to `metadata.labels`. Existing labels win.
    #[must_use]
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        if let Some(metadata) = self.body.get_mut("metadata").and_then(Value::as_object_mut) {
            let entry = metadata
                .entry("labels")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(existing) = entry.as_object_mut() {
                for (key, value) in labels {
                    existing
                        .entry(key.clone())
                        .or_insert_with(|| Value::String(value.clone()));
                }
            }
        }
        self
    }

    /// Identity key.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Apply precedence of this resource's kind.
    #[must_use]
    pub fn precedence(&self) -> usize {
        precedence(&self.kind)
    }

    /// Renders the resource as one YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.body)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key(), f)
    }
}
