//! `docker` CLI image builder.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ImageRef;
use crate::error::RemoteError;

use super::{BuildContext, ImageBuilder, PushOutcome, RegistryLogin, run_tool};

/// Builds and pushes images with the local `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Uses `docker` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: String::from("docker"),
        }
    }

    /// Uses a specific binary, e.g. `podman`.
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    async fn login(&self, login: &RegistryLogin) -> Result<(), RemoteError> {
        debug!("Logging in to {} as {}", login.registry, login.username);
        let mut command = self.command();
        command.args([
            "login",
            &login.registry,
            "--username",
            &login.username,
            "--password-stdin",
        ]);
        run_tool(command, Some(login.password.expose().as_bytes())).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build(&self, image: &ImageRef, context: &BuildContext) -> Result<(), RemoteError> {
        info!("Building {image}");
        let mut command = self.command();
        command
            .arg("build")
            .arg("--tag")
            .arg(image.to_string())
            .arg("--file")
            .arg(&context.dockerfile)
            .arg(&context.dir);
        let output = run_tool(command, None).await?;
        debug!("docker build finished: {}", last_line(&output.stdout));
        Ok(())
    }

    async fn push(
        &self,
        image: &ImageRef,
        credentials: Option<RegistryLogin>,
    ) -> Result<PushOutcome, RemoteError> {
        if let Some(login) = &credentials {
            self.login(login).await?;
        }

        info!("Pushing {image}");
        let mut command = self.command();
        command.arg("push").arg(image.to_string());
        let output = run_tool(command, None).await?;

        Ok(PushOutcome {
            digest: parse_digest(&output.stdout),
        })
    }
}

/// Extracts `sha256:...` from the `digest:` line docker prints after a push.
fn parse_digest(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (_, rest) = line.split_once("digest: ")?;
        let digest = rest.split_whitespace().next()?;
        digest.starts_with("sha256:").then(|| digest.to_string())
    })
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or_default()
}
