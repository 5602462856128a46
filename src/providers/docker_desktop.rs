//! Local Docker Desktop cluster, read from an existing kubeconfig.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

use crate::config::{Settings, SettingsCheck};
use crate::error::{ProviderError, Result, Violation};

use super::{ClusterInfo, KubeConfig, Provider};

/// Provider identifier.
const ID: &str = "docker_desktop";

/// Context Docker Desktop writes into the kubeconfig.
pub const DEFAULT_CONTEXT: &str = "docker-desktop";

/// Docker Desktop's built-in Kubernetes.
#[derive(Debug)]
pub struct DockerDesktop {
    kubeconfig: PathBuf,
    context: String,
    violations: Vec<Violation>,
}

#[derive(Debug, Deserialize)]
struct KubeconfigFile {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
}

impl DockerDesktop {
    /// Builds the provider from settings: `kubeconfig` (default
    /// `~/.kube/config`) and `context` (default `docker-desktop`).
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let mut check = SettingsCheck::new(format!("provider {ID}"), settings);
        let kubeconfig = check
            .optional_str("kubeconfig")
            .map_or_else(default_kubeconfig, PathBuf::from);
        let context = check
            .optional_str("context")
            .unwrap_or(DEFAULT_CONTEXT)
            .to_string();
        check.allow_only(&["kubeconfig", "context"]);

        Self {
            kubeconfig,
            context,
            violations: check.finish(),
        }
    }

    fn error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Kubeconfig {
            path: self.kubeconfig.clone(),
            message: message.into(),
        }
    }

    async fn read(&self) -> Result<(String, KubeconfigFile)> {
        debug!("Reading kubeconfig {}", self.kubeconfig.display());
        let contents = tokio::fs::read_to_string(&self.kubeconfig)
            .await
            .map_err(|e| self.error(e.to_string()))?;
        let parsed: KubeconfigFile =
            serde_yaml::from_str(&contents).map_err(|e| self.error(e.to_string()))?;
        Ok((contents, parsed))
    }

    fn context_cluster<'a>(&self, file: &'a KubeconfigFile) -> Result<&'a str> {
        file.contexts
            .iter()
            .find(|c| c.name == self.context)
            .map(|c| c.context.cluster.as_str())
            .ok_or_else(|| self.error(format!("context '{}' not found", self.context)).into())
    }
}

fn default_kubeconfig() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kube")
        .join("config")
}

#[async_trait]
impl Provider for DockerDesktop {
    fn id(&self) -> &str {
        ID
    }

    fn validate(&self) -> Vec<Violation> {
        self.violations.clone()
    }

    async fn kubeconfig(&self) -> Result<KubeConfig> {
        let (contents, parsed) = self.read().await?;
        self.context_cluster(&parsed)?;
        Ok(KubeConfig {
            context: Some(self.context.clone()),
            contents,
        })
    }

    async fn describe(&self) -> Result<ClusterInfo> {
        let (_, parsed) = self.read().await?;
        let cluster = self.context_cluster(&parsed)?;
        let endpoint = parsed
            .clusters
            .iter()
            .find(|c| c.name == cluster)
            .and_then(|c| c.cluster.server.clone());

        Ok(ClusterInfo {
            id: self.context.clone(),
            name: cluster.to_string(),
            region: None,
            version: None,
            endpoint,
        })
    }
}
