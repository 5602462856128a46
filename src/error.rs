//! Error types for the berth deployment engine.
//!
//! Errors are grouped by the component that raises them: definition
//! evaluation, credentials, provider/plugin registries, settings validation,
//! plugin ordering, and remote execution. Everything raised before the
//! executor reaches `Building` is user-fixable and happens before any
//! external side effect.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::executor::Stage;

/// The main error type for berth.
#[derive(Debug, Error)]
pub enum BerthError {
    /// Malformed or incomplete deployment definition.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Credential store errors.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Unregistered provider or plugin identifier.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Cluster provider API or kubeconfig errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Aggregated settings violations.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A plugin was declared before a plugin it depends on.
    #[error("Plugin order error: {0}")]
    PluginOrder(#[from] PluginOrderError),

    /// Failure while building, pushing or applying.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Where in a definition file an error was found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    /// Definition file, when evaluating from disk.
    pub file: Option<PathBuf>,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
    /// Enclosing blocks, outermost first.
    pub scope: Vec<String>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self
            .file
            .as_ref()
            .map_or_else(|| String::from("<input>"), |p| p.display().to_string());
        write!(f, "{file}:{}:{}", self.line, self.column)?;
        if !self.scope.is_empty() {
            write!(f, " in {}", self.scope.join(" > "))?;
        }
        Ok(())
    }
}

/// Definition evaluation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The definition file was not found.
    #[error("Definition file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The file is not valid KDL.
    #[error("Failed to parse {file}: {message}")]
    Syntax {
        /// File being parsed.
        file: String,
        /// Parser message.
        message: String,
    },

    /// A block or field name that is not part of the language.
    #[error("Unknown {kind} '{name}' at {location}")]
    UnknownNode {
        /// "block" or "field".
        kind: &'static str,
        /// The offending name.
        name: String,
        /// Where it was found.
        location: Location,
    },

    /// A required field was never set.
    #[error("Missing required field '{field}' at {location}")]
    MissingField {
        /// The missing field.
        field: String,
        /// The block that should have contained it.
        location: Location,
    },

    /// A field or block used outside of an `environment` block.
    #[error("'{name}' must be declared inside an environment block ({location})")]
    OutsideScope {
        /// The offending name.
        name: String,
        /// Where it was found.
        location: Location,
    },

    /// A value of the wrong shape.
    #[error("Invalid value for '{field}' at {location}: {message}")]
    InvalidValue {
        /// The field.
        field: String,
        /// What is wrong with it.
        message: String,
        /// Where it was found.
        location: Location,
    },

    /// The requested environment is not defined.
    #[error("Environment '{name}' is not defined (available: {available})")]
    UnknownEnvironment {
        /// Requested name.
        name: String,
        /// Comma separated list of defined environments.
        available: String,
    },

    /// No environment was selected and the choice is ambiguous.
    #[error("No environment selected: {message}")]
    NoEnvironment {
        /// Explanation.
        message: String,
    },
}

/// Credential store errors. Both are fatal: the run aborts before any
/// external call.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Unlock material is absent and strict mode was requested.
    #[error("Missing unlock key: set {env_key} or create {key_path}")]
    MissingKey {
        /// Key file that was looked for.
        key_path: PathBuf,
        /// Environment variable that was looked for.
        env_key: String,
    },

    /// The key is not present in the decrypted store.
    #[error("Unknown secret '{key}' in {store}")]
    UnknownSecret {
        /// The requested key.
        key: String,
        /// Store path.
        store: PathBuf,
    },

    /// The store could not be read or decrypted.
    #[error("Credential store {store} is unreadable: {message}")]
    Corrupted {
        /// Store path.
        store: PathBuf,
        /// Description of the failure.
        message: String,
    },
}

/// Provider / plugin lookup errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No provider with this identifier.
    #[error("Unknown provider '{id}' (registered: {registered})")]
    UnknownProvider {
        /// Requested identifier.
        id: String,
        /// Comma separated registered identifiers.
        registered: String,
    },

    /// No plugin with this identifier.
    #[error("Unknown plugin '{id}' (registered: {registered})")]
    UnknownPlugin {
        /// Requested identifier.
        id: String,
        /// Comma separated registered identifiers.
        registered: String,
    },
}

/// Cluster provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The API rejected the credentials.
    #[error("{provider} authentication failed: {message}")]
    AuthenticationFailed {
        /// Provider identifier.
        provider: String,
        /// Description of the auth failure.
        message: String,
    },

    /// API request failed.
    #[error("{provider} API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// Provider identifier.
        provider: String,
        /// HTTP status code.
        status: u16,
        /// Error message from API.
        message: String,
    },

    /// Rate limited.
    #[error("{provider} API rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Provider identifier.
        provider: String,
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The configured cluster does not exist.
    #[error("Cluster not found: {cluster_id}")]
    ClusterNotFound {
        /// Requested cluster.
        cluster_id: String,
    },

    /// Network error.
    #[error("Network error communicating with {provider}: {message}")]
    NetworkError {
        /// Provider identifier.
        provider: String,
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from API.
    #[error("Invalid response from {provider} API: {message}")]
    InvalidResponse {
        /// Provider identifier.
        provider: String,
        /// Description of the response issue.
        message: String,
    },

    /// A local kubeconfig could not be read or lacks the requested context.
    #[error("Kubeconfig {path}: {message}")]
    Kubeconfig {
        /// Kubeconfig path.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },
}

impl ProviderError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(provider: &str, status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            provider: provider.to_string(),
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(provider: &str, message: impl Into<String>) -> Self {
        Self::NetworkError {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

/// A single settings violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Provider or plugin the settings belong to (e.g. `provider digitalocean`).
    pub subject: String,
    /// Dotted field path.
    pub field: String,
    /// What is wrong.
    pub message: String,
}

impl Violation {
    /// Creates a violation.
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.subject, self.field, self.message)
    }
}

/// All violations found in one validation pass.
#[derive(Debug)]
pub struct ValidationError {
    /// Every violation, in discovery order.
    pub violations: Vec<Violation>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Validation failed with {} violation(s):", self.violations.len())?;
        for (i, violation) in self.violations.iter().enumerate() {
            writeln!(f, "  {}. {violation}", i + 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    /// Returns true if any violation concerns the given field.
    #[must_use]
    pub fn mentions(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

/// Plugin dependency ordering violation.
#[derive(Debug, Error)]
#[error("plugin '{plugin}' requires '{requires}': {reason}")]
pub struct PluginOrderError {
    /// The dependent plugin.
    pub plugin: String,
    /// The plugin it requires.
    pub requires: String,
    /// Why the order is invalid.
    pub reason: String,
}

/// Failure of an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    /// The caller-supplied timeout elapsed.
    #[error("timed out after {after}")]
    Timeout {
        /// Human readable duration.
        after: String,
    },

    /// The remote system reported an error.
    #[error("{message}")]
    Remote {
        /// Raw cause.
        message: String,
    },

    /// The cluster rejected one resource.
    #[error("{resource} rejected: {message}")]
    Rejected {
        /// `Kind/namespace/name` of the rejected resource.
        resource: String,
        /// Raw cause.
        message: String,
    },

    /// The run was cancelled between steps.
    #[error("cancelled")]
    Cancelled,
}

impl RemoteError {
    /// Creates a remote error.
    #[must_use]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Creates a timeout error from a duration.
    #[must_use]
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout {
            after: humantime::format_duration(after).to_string(),
        }
    }
}

/// Execution failure with the exact stage, so re-runs can be scoped.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The run ended in `Failed(stage, cause)`.
    #[error("{stage} failed: {cause}")]
    Failed {
        /// Stage that failed.
        stage: Stage,
        /// Raw cause.
        cause: RemoteError,
    },
}

/// Result type alias for berth operations.
pub type Result<T> = std::result::Result<T, BerthError>;

impl BerthError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::RateLimited { .. } | ProviderError::NetworkError { .. })
        )
    }

    /// Returns the delay the server asked for before retrying, in seconds.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::RateLimited {
                retry_after_secs, ..
            }) => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Returns the failed execution stage, if this is an execution error.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Execution(ExecutionError::Failed { stage, .. }) => Some(*stage),
            _ => None,
        }
    }

    /// Returns true for errors the user fixes by editing the definition.
    #[must_use]
    pub const fn is_user_fixable(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Registry(_) | Self::Validation(_) | Self::PluginOrder(_)
        )
    }
}

impl ConfigError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>, location: Location) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
            location,
        }
    }
}
