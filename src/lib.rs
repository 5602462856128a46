// ============================================================================
// Strict linting
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::too_many_arguments)]
#![warn(clippy::cognitive_complexity)]
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Berth
//!
//! Declarative, idempotent deployment of a container image to a Kubernetes
//! cluster, driven by layered KDL environment definitions.
//!
//! ## Overview
//!
//! A run evaluates one environment from one or more definition files,
//! resolves `(secret)"KEY"` references against an encrypted credential
//! store, validates the cluster provider and application plugins it names,
//! composes an ordered manifest, then builds, pushes and applies:
//!
//! ```text
//! Idle -> Resolving -> Building -> Pushing -> Applying -> Done
//!                                                      \-> Failed(stage, cause)
//! ```
//!
//! Definition and validation errors abort before any external call.
//! Failures of the image toolchain or the cluster leave the run in
//! `Failed(stage, cause)` without rolling anything back; re-running
//! converges.
//!
//! ## Modules
//!
//! - [`credentials`]: encrypted store and once-only secret resolution
//! - [`config`]: KDL evaluation, typed environments, validation, hashing
//! - [`providers`]: cluster providers (`digitalocean`, `docker_desktop`)
//! - [`plugins`]: manifest contributors (`postgres`, `rails_app`)
//! - [`manifest`]: resources, ordering and the manifest builder
//! - [`backends`]: `docker` and `kubectl` collaborators
//! - [`executor`]: the run state machine
//! - [`cli`]: command-line interface
//!
//! ## Example
//!
//! ```kdl
//! app "kuby-test"
//!
//! environment "production" {
//!     docker {
//!         credentials {
//!             username (secret)"DOCKER_USERNAME"
//!             password (secret)"DOCKER_PASSWORD"
//!             email "ops@example.com"
//!         }
//!         image_url "docker.io/acme/app"
//!     }
//!     kubernetes {
//!         provider "digitalocean" {
//!             access_token (secret)"DIGITALOCEAN_ACCESS_TOKEN"
//!             cluster_id "0f3d6c1e"
//!         }
//!         add_plugin "postgres" {
//!             user "app"
//!             password (secret)"DB_PASSWORD"
//!         }
//!         add_plugin "rails_app" {
//!             hostname "app.example.com"
//!             manage_database #true
//!         }
//!     }
//! }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod backends;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod plugins;
pub mod providers;

// ============================================================================
// Re-exports
// ============================================================================

pub use backends::{ApplyOutcome, ClusterApi, ClusterSession, DockerCli, ImageBuilder, Kubectl};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, Definition, Environment};
pub use credentials::{CredentialResolver, CredentialSource, SecretString};
pub use error::{BerthError, Result};
pub use executor::{CancelSignal, DeploymentExecutor, RunOptions, RunReport, RunState, Stage};
pub use manifest::{Manifest, ManifestBuilder, Resource};
pub use plugins::{Plugin, PluginRegistry};
pub use providers::{Provider, ProviderRegistry};
