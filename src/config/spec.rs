//! Evaluated deployment definition types.
//!
//! These are produced by the evaluator and immutable afterwards. Secret
//! references are already resolved; their values are wrapped in
//! [`SecretString`] so they never reach logs or `show` output.

use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;

use crate::credentials::SecretString;

/// Registry used when an image URL has no host part.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// A complete definition: every environment declared across all files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Definition {
    /// Application name.
    pub app: String,
    /// Environments by name, in first-declaration order.
    pub environments: IndexMap<String, Environment>,
}

/// A named deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    /// Environment name (e.g. "production").
    pub name: String,
    /// Application name, copied from the definition.
    pub app: String,
    /// Image and registry settings.
    pub docker: DockerConfig,
    /// Cluster provider and plugins.
    pub kubernetes: KubernetesConfig,
}

/// Image and registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DockerConfig {
    /// Image reference without tag.
    pub image: ImageRef,
    /// Registry credentials, when the registry is private.
    pub credentials: Option<RegistryCredentials>,
    /// Dockerfile path, relative to the build context.
    pub dockerfile: String,
    /// Build context directory.
    pub build_context: String,
}

/// Registry login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryCredentials {
    /// Registry user.
    pub username: Value,
    /// Registry password or token.
    pub password: Value,
    /// Account email.
    pub email: Value,
}

/// Cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KubernetesConfig {
    /// Namespace override.
    pub namespace: Option<String>,
    /// Declared providers, in effective declaration order.
    pub providers: IndexMap<String, Settings>,
    /// Declared plugins, in effective declaration order.
    pub plugins: IndexMap<String, Settings>,
}

impl KubernetesConfig {
    /// Returns the active provider: the one declared last.
    #[must_use]
    pub fn provider(&self) -> Option<(&str, &Settings)> {
        self.providers.last().map(|(id, settings)| (id.as_str(), settings))
    }
}

impl Environment {
    /// Namespace all resources are placed in.
    #[must_use]
    pub fn namespace(&self) -> String {
        self.kubernetes
            .namespace
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.app, self.name))
    }

    /// Name of the image pull secret, when credentials are configured.
    #[must_use]
    pub fn registry_secret_name(&self) -> Option<String> {
        self.docker
            .credentials
            .as_ref()
            .map(|_| format!("{}-registry", self.app))
    }
}

/// A scalar value from the definition.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    /// A string literal.
    Str(String),
    /// An integer literal.
    Int(i64),
    /// A boolean literal.
    Bool(bool),
    /// A resolved `(secret)"KEY"` reference.
    Secret {
        /// Store key.
        key: String,
        /// Resolved value.
        value: SecretString,
    },
}

impl Value {
    /// Returns the textual value (literal string or secret).
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Secret { value, .. } => Some(value.expose()),
            Self::Int(_) | Self::Bool(_) => None,
        }
    }

    /// Returns the integer value.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean value.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Kind name used in messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "integer",
            Self::Bool(_) => "boolean",
            Self::Secret { .. } => "secret",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Secret { key, .. } => write!(f, "(secret){key:?}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Str(s) => serializer.serialize_str(s),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Secret { key, .. } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("secret", key)?;
                map.end()
            }
        }
    }
}

/// One entry of a provider or plugin settings block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Setting {
    /// A scalar.
    Value(Value),
    /// A nested block.
    Block(Settings),
}

/// Ordered, schema-free settings of a provider or plugin block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Settings(IndexMap<String, Setting>);

impl Settings {
    /// Creates an empty settings block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value, replacing any previous one (last write wins).
    pub fn set(&mut self, name: impl Into<String>, setting: Setting) {
        self.0.insert(name.into(), setting);
    }

    /// Builder-style [`Self::set`] for scalar values.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, Setting::Value(value));
        self
    }

    /// Builder-style [`Self::set`] for nested blocks.
    #[must_use]
    pub fn with_block(mut self, name: impl Into<String>, block: Self) -> Self {
        self.set(name, Setting::Block(block));
        self
    }

    /// Returns a raw entry.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Setting> {
        self.0.get(name)
    }

    /// Returns a scalar entry.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.0.get(name) {
            Some(Setting::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns a string or secret entry.
    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        self.value(name).and_then(Value::as_str)
    }

    /// Returns an integer entry.
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        self.value(name).and_then(Value::as_int)
    }

    /// Returns a boolean entry.
    #[must_use]
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.value(name).and_then(Value::as_bool)
    }

    /// Returns a nested block.
    #[must_use]
    pub fn block(&self, name: &str) -> Option<&Self> {
        match self.0.get(name) {
            Some(Setting::Block(b)) => Some(b),
            _ => None,
        }
    }

    /// Iterates entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Setting)> {
        self.0.iter()
    }

    /// Returns true if no entries are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A container image reference: `registry/repository[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Registry host, with optional port.
    pub registry: String,
    /// Repository path.
    pub repository: String,
    /// Tag, once chosen.
    pub tag: Option<String>,
}

impl ImageRef {
    /// Parses an image URL such as `docker.io/acme/app` or
    /// `registry.example.com:5000/team/app:v1`.
    ///
    /// # Errors
    ///
    /// Returns a message describing why the reference is invalid.
    pub fn parse(url: &str) -> std::result::Result<Self, String> {
        let url = url.trim();
        if url.is_empty() {
            return Err(String::from("image URL cannot be empty"));
        }
        if url.contains("://") {
            return Err(format!("image URL '{url}' must not contain a scheme"));
        }

        let (registry, rest) = match url.split_once('/') {
            Some((host, rest)) if is_registry_host(host) => (host.to_string(), rest),
            _ => (String::from(DEFAULT_REGISTRY), url),
        };

        // A ':' after the last '/' separates the tag.
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag.to_string())),
            _ => (rest, None),
        };

        if repository.is_empty() {
            return Err(format!("image URL '{url}' has no repository path"));
        }
        for component in repository.split('/') {
            if !is_valid_path_component(component) {
                return Err(format!(
                    "repository component '{component}' in '{url}' must be lowercase alphanumeric with '.', '_' or '-' separators"
                ));
            }
        }
        if let Some(tag) = &tag
            && !is_valid_tag(tag)
        {
            return Err(format!("tag '{tag}' in '{url}' is invalid"));
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
        })
    }

    /// Returns a copy with the given tag.
    #[must_use]
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..self.clone()
        }
    }

    /// `registry/repository` without tag.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        Ok(())
    }
}

impl Serialize for ImageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A first path segment is a registry host if it looks like one.
fn is_registry_host(host: &str) -> bool {
    host == "localhost" || host.contains('.') || host.contains(':')
}

fn is_valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        && component.starts_with(|c: char| c.is_ascii_alphanumeric())
        && component.ends_with(|c: char| c.is_ascii_alphanumeric())
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !tag.starts_with(['.', '-'])
}
