//! Deployment definition module.
//!
//! This module handles everything between the definition files and an
//! evaluated, validated environment:
//! - Evaluating `berth.kdl` into typed structures
//! - Validation of environment-level values and settings blocks
//! - Computing definition hashes for default tags

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::{ConfigHasher, TAG_LEN};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    DEFAULT_REGISTRY, Definition, DockerConfig, Environment, ImageRef, KubernetesConfig,
    RegistryCredentials, Setting, Settings, Value,
};
pub use validator::{ConfigValidator, MAX_NAME_LEN, SettingsCheck, ValidationResult, is_valid_name};
