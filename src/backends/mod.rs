//! External collaborators of the executor: the image toolchain and the
//! cluster API.
//!
//! The built-in backends shell out to `docker` and `kubectl`. Errors are
//! reported as [`RemoteError`] with the tool's raw output as cause.

mod docker;
mod kubectl;

pub use docker::DockerCli;
pub use kubectl::Kubectl;

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::ImageRef;
use crate::credentials::SecretString;
use crate::error::RemoteError;
use crate::manifest::Resource;
use crate::providers::KubeConfig;

/// Directory and Dockerfile of an image build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Build context directory.
    pub dir: PathBuf,
    /// Dockerfile path.
    pub dockerfile: PathBuf,
}

/// Registry login used for pushing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLogin {
    /// Registry host.
    pub registry: String,
    /// User name.
    pub username: String,
    /// Password or token.
    pub password: SecretString,
}

/// Result of a successful push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Content digest reported by the registry, when available.
    pub digest: Option<String>,
}

/// Result of applying one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    /// The cluster changed.
    Applied,
    /// The live object already matched.
    Unchanged,
}

/// Container build toolchain.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds `image` from `context`.
    async fn build(&self, image: &ImageRef, context: &BuildContext) -> Result<(), RemoteError>;

    /// Pushes `image`, logging in first when credentials are given.
    async fn push(
        &self,
        image: &ImageRef,
        credentials: Option<RegistryLogin>,
    ) -> Result<PushOutcome, RemoteError>;
}

/// Cluster API entry point.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Opens a session against the cluster described by `kubeconfig`.
    async fn connect(&self, kubeconfig: &KubeConfig) -> Result<Box<dyn ClusterSession>, RemoteError>;
}

/// An open cluster session. `apply` may be called concurrently.
#[async_trait]
pub trait ClusterSession: Send + Sync {
    /// Creates or updates one resource.
    async fn apply(&self, resource: &Resource) -> Result<ApplyOutcome, RemoteError>;
}

/// Output of a finished tool invocation.
#[derive(Debug)]
struct ToolOutput {
    stdout: String,
    stderr: String,
}

/// Runs a prepared command, optionally feeding `input` on stdin, and maps a
/// non-zero exit to `RemoteError::Remote` carrying stderr.
async fn run_tool(mut command: Command, input: Option<&[u8]>) -> Result<ToolOutput, RemoteError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    command
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| RemoteError::remote(format!("failed to start {program}: {e}")))?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(input)
            .await
            .map_err(|e| RemoteError::remote(format!("failed to write to {program}: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| RemoteError::remote(format!("failed to wait for {program}: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        let message = if stderr.is_empty() {
            format!("{program} exited with {}", output.status)
        } else {
            stderr
        };
        return Err(RemoteError::remote(message));
    }

    Ok(ToolOutput { stdout, stderr })
}
