//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::executor::{DEFAULT_CONCURRENCY, RunOptions};

/// Berth - declarative deployments to Kubernetes.
#[derive(Parser, Debug)]
#[command(name = "berth")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Definition files, evaluated in order. Defaults to the nearest
    /// `berth.kdl`.
    #[arg(short, long, global = true, env = "BERTH_CONFIG", value_delimiter = ',')]
    pub config: Vec<PathBuf>,

    /// Environment to act on. May be omitted when only one is defined.
    #[arg(short, long, global = true, env = "BERTH_ENV")]
    pub environment: Option<String>,

    /// Encrypted credential store.
    #[arg(long, global = true, env = "BERTH_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Unlock key file for the credential store.
    #[arg(long, global = true, env = "BERTH_KEY_PATH")]
    pub key_path: Option<PathBuf>,

    /// Fail when no unlock key is available instead of treating the store
    /// as empty.
    #[arg(long, global = true)]
    pub strict_credentials: bool,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate the definition and validate provider and plugin settings.
    Validate,

    /// Print the evaluated environment with secrets redacted.
    Show,

    /// Print the rendered manifest without contacting the registry or
    /// applying anything.
    Manifest {
        /// Image tag (defaults to a hash of the environment and build context).
        #[arg(long)]
        tag: Option<String>,
    },

    /// Build, push and apply.
    Deploy {
        /// Run options.
        #[command(flatten)]
        run: RunArgs,

        /// Apply the existing image without building or pushing.
        #[arg(long)]
        skip_build: bool,
    },

    /// Apply the manifest without building (same as `deploy --skip-build`).
    Apply {
        /// Run options.
        #[command(flatten)]
        run: RunArgs,
    },

    /// Cluster provider calls.
    Remote {
        /// Remote subcommand.
        #[command(subcommand)]
        command: RemoteCommands,
    },

    /// Manage the encrypted credential store.
    Credentials {
        /// Credentials subcommand.
        #[command(subcommand)]
        command: CredentialCommands,
    },
}

/// Provider subcommands.
#[derive(Subcommand, Debug)]
pub enum RemoteCommands {
    /// Describe the target cluster.
    Describe,

    /// Print the kubeconfig for the target cluster.
    Kubeconfig,
}

/// Credential store subcommands.
#[derive(Subcommand, Debug)]
pub enum CredentialCommands {
    /// Encrypt a plaintext YAML file into the store.
    Encrypt {
        /// Plaintext YAML mapping of secret keys.
        plaintext: PathBuf,

        /// Store to write (defaults to the configured store).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List the keys in the store.
    #[command(alias = "show-keys")]
    Keys,
}

/// Options shared by `deploy` and `apply`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Image tag (defaults to a hash of the environment and build context).
    #[arg(long)]
    pub tag: Option<String>,

    /// Resources applied concurrently.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Limit for the image build.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30m")]
    pub build_timeout: Duration,

    /// Limit for the image push.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "15m")]
    pub push_timeout: Duration,

    /// Limit for each cluster call.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2m")]
    pub apply_timeout: Duration,
}

impl RunArgs {
    /// Converts to executor options.
    #[must_use]
    pub fn options(&self, skip_build: bool, build_context: Option<PathBuf>) -> RunOptions {
        RunOptions {
            tag: self.tag.clone(),
            skip_build,
            build_timeout: self.build_timeout,
            push_timeout: self.push_timeout,
            apply_timeout: self.apply_timeout,
            concurrency: self.concurrency,
            build_context,
        }
    }
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}
