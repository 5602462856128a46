//! Cluster provider registry.
//!
//! A provider turns the settings of the active `provider "<id>" { .. }`
//! block into cluster access: a kubeconfig and a description of the cluster.
//! Providers are looked up by identifier in a [`ProviderRegistry`].

mod digitalocean;
mod docker_desktop;

pub use digitalocean::{DEFAULT_API_URL, DigitalOcean, DigitalOceanClient};
pub use docker_desktop::{DEFAULT_CONTEXT, DockerDesktop};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::config::Settings;
use crate::error::{RegistryError, Result, Violation};

/// Credentials and endpoint needed to talk to a cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct KubeConfig {
    /// Context to use; `None` means the file's current context.
    pub context: Option<String>,
    /// Kubeconfig YAML.
    pub contents: String,
}

impl fmt::Debug for KubeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeConfig")
            .field("context", &self.context)
            .field("contents", &format_args!("<{} bytes>", self.contents.len()))
            .finish()
    }
}

/// What a provider knows about its cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    /// Provider-specific cluster identifier.
    pub id: String,
    /// Human readable name.
    pub name: String,
    /// Region or location, if meaningful.
    pub region: Option<String>,
    /// Kubernetes version.
    pub version: Option<String>,
    /// API server endpoint.
    pub endpoint: Option<String>,
}

/// A cluster provider built from one settings block.
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    /// Registry identifier.
    fn id(&self) -> &str;

    /// Checks the settings this provider was built from. Every problem is
    /// returned, not just the first.
    fn validate(&self) -> Vec<Violation>;

    /// Fetches the kubeconfig for the cluster.
    async fn kubeconfig(&self) -> Result<KubeConfig>;

    /// Describes the cluster.
    async fn describe(&self) -> Result<ClusterInfo>;
}

/// Builds a provider from its settings. Factories never fail: invalid
/// settings are reported by [`Provider::validate`].
pub type ProviderFactory = Arc<dyn Fn(&Settings) -> Box<dyn Provider> + Send + Sync>;

/// Maps provider identifiers to factories.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with `digitalocean` and `docker_desktop`.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("digitalocean", |settings| {
            Box::new(DigitalOcean::from_settings(settings))
        });
        registry.register("docker_desktop", |settings| {
            Box::new(DockerDesktop::from_settings(settings))
        });
        registry
    }

    /// Registers a factory, replacing any previous one with the same id.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&Settings) -> Box<dyn Provider> + Send + Sync + 'static,
    {
        let id = id.into();
        debug!("Registering provider '{id}'");
        self.factories.insert(id, Arc::new(factory));
    }

    /// Builds the provider registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` if nothing is registered under `id`.
    pub fn build(&self, id: &str, settings: &Settings) -> Result<Box<dyn Provider>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| RegistryError::UnknownProvider {
                id: id.to_string(),
                registered: self.ids().join(", "),
            })?;
        Ok(factory(settings))
    }

    /// Registered identifiers, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Returns true if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Value;
    use crate::error::BerthError;

    #[test]
    fn test_builtin_ids() {
        let registry = ProviderRegistry::with_builtin();
        assert_eq!(registry.ids(), vec!["digitalocean", "docker_desktop"]);
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ProviderRegistry::with_builtin();
        let err = registry.build("aws", &Settings::new()).unwrap_err();
        let BerthError::Registry(RegistryError::UnknownProvider { id, registered }) = err else {
            panic!("expected unknown provider, got {err:?}");
        };
        assert_eq!(id, "aws");
        assert_eq!(registered, "digitalocean, docker_desktop");
    }

    #[test]
    fn test_build_validates_settings() {
        let registry = ProviderRegistry::with_builtin();
        let settings = Settings::new().with("cluster_id", Value::Str(String::new()));
        let provider = registry.build("digitalocean", &settings).unwrap();
        assert_eq!(provider.id(), "digitalocean");

        let fields: Vec<String> = provider.validate().into_iter().map(|v| v.field).collect();
        assert_eq!(fields, vec!["access_token", "cluster_id"]);
    }

    #[test]
    fn test_custom_provider_registration() {
        #[derive(Debug)]
        struct Static;

        #[async_trait]
        impl Provider for Static {
            fn id(&self) -> &str {
                "static"
            }
            fn validate(&self) -> Vec<Violation> {
                Vec::new()
            }
            async fn kubeconfig(&self) -> Result<KubeConfig> {
                Ok(KubeConfig {
                    context: None,
                    contents: String::new(),
                })
            }
            async fn describe(&self) -> Result<ClusterInfo> {
                Ok(ClusterInfo::default())
            }
        }

        let mut registry = ProviderRegistry::new();
        registry.register("static", |_| Box::new(Static));
        assert!(registry.contains("static"));
        assert!(registry.build("static", &Settings::new()).is_ok());
    }

    #[test]
    fn test_kubeconfig_debug_hides_contents() {
        let kubeconfig = KubeConfig {
            context: Some(String::from("do-nyc1-prod")),
            contents: String::from("token: abc"),
        };
        let debug = format!("{kubeconfig:?}");
        assert!(!debug.contains("abc"));
        assert!(debug.contains("10 bytes"));
    }
}
