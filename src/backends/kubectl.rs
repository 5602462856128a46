//! `kubectl` cluster backend.

use async_trait::async_trait;
use std::io::Write;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use crate::error::RemoteError;
use crate::manifest::Resource;
use crate::providers::KubeConfig;

use super::{ApplyOutcome, ClusterApi, ClusterSession, run_tool};

/// Applies resources with `kubectl apply -f -`.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new()
    }
}

impl Kubectl {
    /// Uses `kubectl` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: String::from("kubectl"),
        }
    }

    /// Uses a specific binary.
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ClusterApi for Kubectl {
    async fn connect(&self, kubeconfig: &KubeConfig) -> Result<Box<dyn ClusterSession>, RemoteError> {
        let mut file = NamedTempFile::new()
            .map_err(|e| RemoteError::remote(format!("failed to create kubeconfig file: {e}")))?;
        file.write_all(kubeconfig.contents.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| RemoteError::remote(format!("failed to write kubeconfig file: {e}")))?;
        debug!("Wrote kubeconfig to {}", file.path().display());

        Ok(Box::new(KubectlSession {
            binary: self.binary.clone(),
            context: kubeconfig.context.clone(),
            kubeconfig: file,
        }))
    }
}

/// Session bound to one kubeconfig. The file is removed when the session
/// is dropped.
#[derive(Debug)]
struct KubectlSession {
    binary: String,
    context: Option<String>,
    kubeconfig: NamedTempFile,
}

#[async_trait]
impl ClusterSession for KubectlSession {
    async fn apply(&self, resource: &Resource) -> Result<ApplyOutcome, RemoteError> {
        let document = serde_json::to_vec(&resource.body)
            .map_err(|e| RemoteError::remote(format!("failed to encode {resource}: {e}")))?;

        let mut command = Command::new(&self.binary);
        command.arg("--kubeconfig").arg(self.kubeconfig.path());
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        command.args(["apply", "-f", "-"]);

        let output = run_tool(command, Some(&document))
            .await
            .map_err(|e| match e {
                RemoteError::Remote { message } => RemoteError::Rejected {
                    resource: resource.key().to_string(),
                    message,
                },
                other => other,
            })?;

        let outcome = parse_outcome(&output.stdout);
        debug!("{resource}: {outcome:?}");
        if !output.stderr.is_empty() {
            debug!("kubectl stderr for {resource}: {}", output.stderr);
        }
        Ok(outcome)
    }
}

/// `deployment.apps/web unchanged` means nothing changed; `created` and
/// `configured` both count as applied.
fn parse_outcome(stdout: &str) -> ApplyOutcome {
    let unchanged = stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .all(|l| l.trim_end().ends_with(" unchanged"));
    if unchanged && !stdout.trim().is_empty() {
        ApplyOutcome::Unchanged
    } else {
        ApplyOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outcome() {
        assert_eq!(parse_outcome("deployment.apps/web unchanged\n"), ApplyOutcome::Unchanged);
        assert_eq!(parse_outcome("deployment.apps/web configured\n"), ApplyOutcome::Applied);
        assert_eq!(parse_outcome("namespace/prod created\n"), ApplyOutcome::Applied);
        assert_eq!(parse_outcome(""), ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_connect_writes_kubeconfig_and_rejects_on_failure() {
        let kubectl = Kubectl::with_binary("/nonexistent/kubectl");
        let kubeconfig = KubeConfig {
            context: Some(String::from("prod")),
            contents: String::from("apiVersion: v1\nkind: Config\n"),
        };
        let session = kubectl.connect(&kubeconfig).await.unwrap();
        let resource = Resource::new("v1", "Namespace", "prod", None);

        let err = session.apply(&resource).await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { ref resource, .. } if resource == "Namespace/prod"));
    }
}
