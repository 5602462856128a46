//! Definition hashing for change detection and default image tags.
//!
//! Hashes are computed over the canonical JSON form of an environment.
//! Secret values never enter the hash, only their keys. The default image
//! tag also covers the build context, so a source change yields a new tag.

use sha2::{Digest, Sha256};
use std::path::Path;
use walkdir::WalkDir;

use super::spec::Environment;
use crate::error::Result;

/// Length of the default image tag.
pub const TAG_LEN: usize = 12;

/// Directories never sent to the image build.
const SKIPPED_DIRS: &[&str] = &[".git", "log", "tmp", "node_modules"];

/// Hasher for computing definition hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new definition hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of one evaluated environment.
    ///
    /// Declaration order is part of the hash since it drives plugin
    /// ordering and the active provider.
    #[must_use]
    pub fn hash_environment(&self, env: &Environment) -> String {
        // Environment only contains strings, integers, booleans and maps, so
        // serialization cannot fail.
        let canonical = serde_json::to_vec(env).unwrap_or_default();
        Self::hash_bytes(&canonical)
    }

    /// Hashes every file under `dir` by relative path and contents, in
    /// file name order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `dir` or a file below it cannot be read.
    pub fn hash_build_context(&self, dir: &Path) -> Result<String> {
        let mut hasher = Sha256::new();
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && SKIPPED_DIRS.iter().any(|skip| e.file_name() == *skip))
            });

        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(std::fs::read(entry.path())?);
            hasher.update([0]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Hex SHA-256 of arbitrary bytes.
    #[must_use]
    pub fn hash_bytes(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Default image tag for `env` built from the project at `root`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the build context cannot be read.
    pub fn default_tag(&self, env: &Environment, root: &Path) -> Result<String> {
        let context = self.hash_build_context(&root.join(&env.docker.build_context))?;
        let combined = format!("{}:{context}", self.hash_environment(env));
        Ok(Self::hash_bytes(combined.as_bytes()).chars().take(TAG_LEN).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{DockerConfig, ImageRef, KubernetesConfig, Settings, Value};
    use crate::credentials::SecretString;
    use indexmap::IndexMap;

    fn create_test_env(token: &str) -> Environment {
        let mut providers = IndexMap::new();
        providers.insert(
            String::from("digitalocean"),
            Settings::new()
                .with(
                    "access_token",
                    Value::Secret {
                        key: String::from("DO_TOKEN"),
                        value: SecretString::new(token.to_string()),
                    },
                )
                .with("cluster_id", Value::Str(String::from("c1"))),
        );
        Environment {
            name: String::from("production"),
            app: String::from("kuby-test"),
            docker: DockerConfig {
                image: ImageRef::parse("docker.io/acme/app").unwrap(),
                credentials: None,
                dockerfile: String::from("Dockerfile"),
                build_context: String::from("."),
            },
            kubernetes: KubernetesConfig {
                namespace: None,
                providers,
                plugins: IndexMap::new(),
            },
        }
    }

    #[test]
    fn test_environment_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let env = create_test_env("t1");
        assert_eq!(hasher.hash_environment(&env), hasher.hash_environment(&env));
    }

    #[test]
    fn test_secret_values_do_not_affect_hash() {
        let hasher = ConfigHasher::new();
        assert_eq!(
            hasher.hash_environment(&create_test_env("t1")),
            hasher.hash_environment(&create_test_env("t2"))
        );
    }

    #[test]
    fn test_different_environments_different_hash() {
        let hasher = ConfigHasher::new();
        let env1 = create_test_env("t1");
        let mut env2 = env1.clone();
        env2.kubernetes.namespace = Some(String::from("custom"));
        assert_ne!(hasher.hash_environment(&env1), hasher.hash_environment(&env2));
    }

    #[test]
    fn test_build_context_changes_tag() {
        let hasher = ConfigHasher::new();
        let env = create_test_env("t1");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.rb"), "puts 1").unwrap();

        let first = hasher.default_tag(&env, dir.path()).unwrap();
        assert_eq!(first.len(), TAG_LEN);
        assert_eq!(first, hasher.default_tag(&env, dir.path()).unwrap());

        std::fs::write(dir.path().join("app.rb"), "puts 2").unwrap();
        assert_ne!(first, hasher.default_tag(&env, dir.path()).unwrap());
    }

    #[test]
    fn test_skipped_dirs_do_not_affect_context() {
        let hasher = ConfigHasher::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM ruby").unwrap();
        let before = hasher.hash_build_context(dir.path()).unwrap();

        std::fs::create_dir(dir.path().join("log")).unwrap();
        std::fs::write(dir.path().join("log/production.log"), "GET /").unwrap();
        assert_eq!(before, hasher.hash_build_context(dir.path()).unwrap());
    }

    #[test]
    fn test_missing_build_context() {
        let err = ConfigHasher::new()
            .hash_build_context(Path::new("/nonexistent/berth/context"))
            .unwrap_err();
        assert!(matches!(err, crate::error::BerthError::Io(_)));
    }
}
