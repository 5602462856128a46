//! Manifest builder: provider + plugins + docker settings into one manifest.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::{ConfigValidator, DEFAULT_REGISTRY, Environment, ImageRef};
use crate::error::{BerthError, Result, ValidationError};
use crate::plugins::{self, Plugin, PluginContext, PluginOutput, PluginRegistry};
use crate::providers::{ClusterInfo, KubeConfig, Provider, ProviderRegistry};

use super::{Manifest, Resource};

/// Docker Hub's key in a docker config file.
const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

/// Provider and plugins for an environment, looked up and validated but
/// not yet called.
#[derive(Debug)]
pub struct Prepared {
    /// Active provider.
    pub provider: Box<dyn Provider>,
    /// Plugins in declaration order.
    pub plugins: Vec<Box<dyn Plugin>>,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
}

/// Everything the executor needs after `Resolving`.
#[derive(Debug)]
pub struct Resolved {
    /// The manifest to apply.
    pub manifest: Manifest,
    /// Tagged image the manifest references.
    pub image: ImageRef,
    /// Cluster access.
    pub kubeconfig: KubeConfig,
    /// Cluster description.
    pub cluster: ClusterInfo,
}

/// Composes manifests from the registries.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    providers: ProviderRegistry,
    plugins: PluginRegistry,
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new(ProviderRegistry::with_builtin(), PluginRegistry::with_builtin())
    }
}

impl ManifestBuilder {
    /// Creates a builder over the given registries.
    #[must_use]
    pub const fn new(providers: ProviderRegistry, plugins: PluginRegistry) -> Self {
        Self { providers, plugins }
    }

    /// Provider registry in use.
    #[must_use]
    pub const fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Looks up the active provider and every plugin, validates all settings
    /// in one pass and checks plugin ordering. No external calls are made.
    ///
    /// # Errors
    ///
    /// `UnknownProvider`/`UnknownPlugin` for unregistered identifiers, a
    /// `ValidationError` listing every violation, or a `PluginOrderError`.
    pub fn prepare(&self, env: &Environment) -> Result<Prepared> {
        let (provider_id, provider_settings) = env.kubernetes.provider().ok_or_else(|| {
            ValidationError {
                violations: vec![crate::error::Violation::new(
                    format!("environment {}", env.name),
                    "kubernetes.provider",
                    "no provider declared",
                )],
            }
        })?;
        let provider = self.providers.build(provider_id, provider_settings)?;
        let plugins = env
            .kubernetes
            .plugins
            .iter()
            .map(|(id, settings)| self.plugins.build(id, settings))
            .collect::<Result<Vec<_>>>()?;

        let mut result = ConfigValidator::new().check(env);
        result.violations.extend(provider.validate());
        for plugin in &plugins {
            result.violations.extend(plugin.validate());
        }
        let warnings = result.into_result()?;
        for warning in &warnings {
            warn!("{warning}");
        }

        plugins::check_order(&plugins)?;

        debug!(
            "Prepared provider '{provider_id}' and {} plugin(s) for '{}'",
            plugins.len(),
            env.name
        );
        Ok(Prepared {
            provider,
            plugins,
            warnings,
        })
    }

    /// Builds the manifest for `env`, deploying `image`.
    ///
    /// # Errors
    ///
    /// Everything [`Self::prepare`] reports, provider errors from fetching
    /// cluster access, and plugin failures.
    pub async fn build(&self, env: &Environment, image: &ImageRef) -> Result<Resolved> {
        let prepared = self.prepare(env)?;
        self.assemble(env, image, prepared).await
    }

    /// Second half of [`Self::build`] for callers that already prepared.
    ///
    /// # Errors
    ///
    /// Provider errors from fetching cluster access, and plugin failures.
    pub async fn assemble(
        &self,
        env: &Environment,
        image: &ImageRef,
        prepared: Prepared,
    ) -> Result<Resolved> {
        let kubeconfig = prepared.provider.kubeconfig().await?;
        let cluster = prepared.provider.describe().await?;
        info!(
            "Cluster '{}' via provider '{}'",
            cluster.name,
            prepared.provider.id()
        );

        let namespace = env.namespace();
        let registry_secret = env.registry_secret_name();
        let labels = standard_labels(env);

        let mut declared = base_resources(env, &namespace)?;
        let mut outputs: IndexMap<String, PluginOutput> = IndexMap::new();

        for plugin in &prepared.plugins {
            let ctx = PluginContext {
                app: &env.app,
                environment: &env.name,
                namespace: &namespace,
                image,
                registry_secret: registry_secret.as_deref(),
                kubeconfig: &kubeconfig,
                cluster: &cluster,
                outputs: &outputs,
            };
            let output = plugin.manifest_fragments(&ctx)?;
            debug!(
                "Plugin '{}' contributed {} resource(s)",
                plugin.id(),
                output.resources.len()
            );
            declared.extend(output.resources.iter().cloned());
            outputs.insert(plugin.id().to_string(), output);
        }

        let manifest =
            Manifest::from_resources(declared.into_iter().map(|r| r.with_labels(&labels)));
        info!("Manifest has {} resource(s)", manifest.len());

        Ok(Resolved {
            manifest,
            image: image.clone(),
            kubeconfig,
            cluster,
        })
    }
}

/// Labels put on every generated resource.
fn standard_labels(env: &Environment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (String::from("app.kubernetes.io/name"), env.app.clone()),
        (
            String::from("app.kubernetes.io/instance"),
            format!("{}-{}", env.app, env.name),
        ),
        (String::from("app.kubernetes.io/managed-by"), String::from("berth")),
    ])
}

/// The namespace and, with registry credentials, the image pull secret.
fn base_resources(env: &Environment, namespace: &str) -> Result<Vec<Resource>> {
    let mut resources = vec![Resource::new("v1", "Namespace", namespace, None)];

    if let (Some(credentials), Some(name)) = (&env.docker.credentials, env.registry_secret_name()) {
        let field = |value: &crate::config::Value, field: &str| {
            value.as_str().map(str::to_string).ok_or_else(|| {
                BerthError::internal(format!("registry credential '{field}' is not a string"))
            })
        };
        let username = field(&credentials.username, "username")?;
        let password = field(&credentials.password, "password")?;
        let email = field(&credentials.email, "email")?;

        let registry = if env.docker.image.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_AUTH_KEY.to_string()
        } else {
            env.docker.image.registry.clone()
        };
        let auth = STANDARD.encode(format!("{username}:{password}"));
        let config = json!({
            "auths": {
                registry: {
                    "username": username,
                    "password": password,
                    "email": email,
                    "auth": auth,
                },
            },
        });

        resources.push(
            Resource::new("v1", "Secret", &name, Some(namespace))
                .with("type", json!("kubernetes.io/dockerconfigjson"))
                .with(
                    "data",
                    json!({ ".dockerconfigjson": STANDARD.encode(config.to_string()) }),
                ),
        );
    }

    Ok(resources)
}
