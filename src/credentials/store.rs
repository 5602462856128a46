//! Credential resolver with lazy, once-only decryption.

use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{BerthError, CredentialError, Result};

use super::cipher;
use super::secret::SecretString;

/// Default location of the encrypted store, relative to the project root.
pub const DEFAULT_STORE_PATH: &str = "config/credentials.yml.enc";

/// Default location of the unlock key, relative to the project root.
pub const DEFAULT_KEY_PATH: &str = "config/master.key";

/// Environment variable holding the unlock key.
pub const DEFAULT_ENV_KEY: &str = "BERTH_MASTER_KEY";

/// Where the store and its unlock material live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSource {
    /// Encrypted store.
    pub config_path: PathBuf,
    /// Hex key file.
    pub key_path: PathBuf,
    /// Environment variable checked before the key file.
    pub env_key: String,
    /// Fail with `MissingKey` when no unlock material is found.
    pub strict: bool,
}

impl CredentialSource {
    /// Creates a source with the default environment variable, non-strict.
    #[must_use]
    pub fn new(config_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            key_path: key_path.into(),
            env_key: String::from(DEFAULT_ENV_KEY),
            strict: false,
        }
    }

    /// Uses the default paths below `root`.
    #[must_use]
    pub fn in_project(root: &Path) -> Self {
        Self::new(root.join(DEFAULT_STORE_PATH), root.join(DEFAULT_KEY_PATH))
    }

    /// Sets the unlock environment variable.
    #[must_use]
    pub fn with_env_key(mut self, env_key: impl Into<String>) -> Self {
        self.env_key = env_key.into();
        self
    }

    /// Sets strict mode.
    #[must_use]
    pub const fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Reads the unlock key: environment variable first, then key file.
    fn read_key(&self) -> Result<Option<String>> {
        if let Ok(key) = std::env::var(&self.env_key)
            && !key.trim().is_empty()
        {
            debug!("Using unlock key from ${}", self.env_key);
            return Ok(Some(key.trim().to_string()));
        }

        if self.key_path.exists() {
            debug!("Using unlock key from {}", self.key_path.display());
            let key = std::fs::read_to_string(&self.key_path)?;
            return Ok(Some(key.trim().to_string()));
        }

        Ok(None)
    }

    fn corrupted(&self, message: impl Into<String>) -> BerthError {
        BerthError::Credential(CredentialError::Corrupted {
            store: self.config_path.clone(),
            message: message.into(),
        })
    }
}

/// Decrypted key/value table. Nested mappings are flattened to dotted keys.
type SecretTable = BTreeMap<String, String>;

/// Resolves secret keys against an encrypted store.
///
/// Create one per run and pass it explicitly to the definition evaluator.
/// The decrypted table is read-only after the first lookup and is never
/// written anywhere.
#[derive(Debug)]
pub struct CredentialResolver {
    source: CredentialSource,
    table: OnceCell<SecretTable>,
}

impl CredentialResolver {
    /// Creates a resolver. Nothing is read until the first lookup.
    #[must_use]
    pub const fn new(source: CredentialSource) -> Self {
        Self {
            source,
            table: OnceCell::new(),
        }
    }

    /// Returns true once the store has been decrypted.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.table.get().is_some()
    }

    /// Resolves `key` to its secret value.
    ///
    /// # Errors
    ///
    /// `MissingKey` when strict and no unlock material exists, `UnknownSecret`
    /// when the key is absent, `Corrupted` when the store cannot be decrypted.
    pub fn resolve(&self, key: &str) -> Result<SecretString> {
        let table = self.unlocked()?;
        table.get(key).map_or_else(
            || {
                Err(BerthError::Credential(CredentialError::UnknownSecret {
                    key: key.to_string(),
                    store: self.source.config_path.clone(),
                }))
            },
            |value| Ok(SecretString::new(value.clone())),
        )
    }

    /// Lists the available keys (never the values).
    ///
    /// # Errors
    ///
    /// Same as [`Self::resolve`] for unlocking.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.unlocked()?.keys().cloned().collect())
    }

    /// Forces decryption now.
    ///
    /// # Errors
    ///
    /// Same as [`Self::resolve`] for unlocking.
    pub fn unlock(&self) -> Result<()> {
        self.unlocked().map(|_| ())
    }

    fn unlocked(&self) -> Result<&SecretTable> {
        self.table.get_or_try_init(|| self.decrypt())
    }

    fn decrypt(&self) -> Result<SecretTable> {
        let source = &self.source;

        let Some(key) = source.read_key()? else {
            if source.strict {
                return Err(BerthError::Credential(CredentialError::MissingKey {
                    key_path: source.key_path.clone(),
                    env_key: source.env_key.clone(),
                }));
            }
            warn!(
                "No unlock key found (${} or {}), credential store treated as empty",
                source.env_key,
                source.key_path.display()
            );
            return Ok(SecretTable::new());
        };

        if !source.config_path.exists() {
            if source.strict {
                return Err(source.corrupted("file not found"));
            }
            warn!(
                "Credential store {} not found, treated as empty",
                source.config_path.display()
            );
            return Ok(SecretTable::new());
        }

        let sealed = std::fs::read_to_string(&source.config_path)?;
        let plaintext = cipher::open(&sealed, &key).map_err(|e| source.corrupted(e))?;
        let document: serde_yaml::Value = serde_yaml::from_str(&plaintext)
            .map_err(|e| source.corrupted(format!("decrypted store is not YAML: {e}")))?;

        let mut table = SecretTable::new();
        flatten(None, &document, &mut table);
        info!(
            "Unlocked credential store {} ({} keys)",
            source.config_path.display(),
            table.len()
        );
        Ok(table)
    }

    /// Encrypts `plaintext` YAML into the store, generating a key file when
    /// neither the key file nor the environment variable provides one.
    /// Returns true if a new key file was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the plaintext is not a YAML mapping or a file
    /// cannot be written.
    pub fn write_store(source: &CredentialSource, plaintext: &str) -> Result<bool> {
        let document: serde_yaml::Value = serde_yaml::from_str(plaintext)
            .map_err(|e| source.corrupted(format!("plaintext is not YAML: {e}")))?;
        if !document.is_mapping() {
            return Err(source.corrupted("plaintext must be a YAML mapping"));
        }

        let (key, created) = match source.read_key()? {
            Some(key) => (key, false),
            None => {
                let key = cipher::generate_key();
                if let Some(parent) = source.key_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&source.key_path, format!("{key}\n"))?;
                info!("Generated new unlock key at {}", source.key_path.display());
                (key, true)
            }
        };

        let sealed = cipher::seal(plaintext, &key).map_err(|e| source.corrupted(e))?;
        if let Some(parent) = source.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&source.config_path, sealed)?;
        Ok(created)
    }
}

/// Flattens a YAML document into dotted keys. Scalars become strings,
/// sequences and nulls are skipped.
fn flatten(prefix: Option<&str>, value: &serde_yaml::Value, table: &mut SecretTable) {
    use serde_yaml::Value;

    let Value::Mapping(mapping) = value else {
        return;
    };

    for (key, value) in mapping {
        let key = match key {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        let path = prefix.map_or_else(|| key.clone(), |p| format!("{p}.{key}"));

        match value {
            Value::String(s) => {
                table.insert(path, s.clone());
            }
            Value::Number(n) => {
                table.insert(path, n.to_string());
            }
            Value::Bool(b) => {
                table.insert(path, b.to_string());
            }
            Value::Mapping(_) => flatten(Some(&path), value, table),
            _ => debug!("Skipping non-scalar credential '{path}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_in(dir: &Path, env_key: &str) -> CredentialSource {
        CredentialSource::in_project(dir).with_env_key(env_key)
    }

    #[test]
    fn test_resolve_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_in(dir.path(), "BERTH_TEST_KEY_RESOLVE");
        let created = CredentialResolver::write_store(
            &source,
            "DOCKER_USERNAME: acme\ndatabase:\n  password: s3cret\n  port: 5432\n",
        )
        .unwrap();
        assert!(created);

        let resolver = CredentialResolver::new(source.strict(true));
        assert!(!resolver.is_unlocked());
        assert_eq!(resolver.resolve("DOCKER_USERNAME").unwrap().expose(), "acme");
        assert!(resolver.is_unlocked());
        assert_eq!(resolver.resolve("database.password").unwrap().expose(), "s3cret");
        assert_eq!(resolver.resolve("database.port").unwrap().expose(), "5432");
        assert_eq!(
            resolver.keys().unwrap(),
            vec!["DOCKER_USERNAME", "database.password", "database.port"]
        );
    }

    #[test]
    fn test_unknown_secret() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_in(dir.path(), "BERTH_TEST_KEY_UNKNOWN");
        CredentialResolver::write_store(&source, "A: b\n").unwrap();

        let resolver = CredentialResolver::new(source);
        let err = resolver.resolve("MISSING").unwrap_err();
        assert!(matches!(
            err,
            BerthError::Credential(CredentialError::UnknownSecret { ref key, .. }) if key == "MISSING"
        ));
    }

    #[test]
    fn test_strict_mode_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_in(dir.path(), "BERTH_TEST_KEY_STRICT").strict(true);
        let resolver = CredentialResolver::new(source);
        let err = resolver.resolve("ANY").unwrap_err();
        assert!(matches!(err, BerthError::Credential(CredentialError::MissingKey { .. })));
    }

    #[test]
    fn test_lenient_mode_without_key_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CredentialResolver::new(source_in(dir.path(), "BERTH_TEST_KEY_LENIENT"));
        assert!(resolver.keys().unwrap().is_empty());
        assert!(matches!(
            resolver.resolve("ANY").unwrap_err(),
            BerthError::Credential(CredentialError::UnknownSecret { .. })
        ));
    }

    #[test]
    fn test_wrong_key_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_in(dir.path(), "BERTH_TEST_KEY_WRONG");
        CredentialResolver::write_store(&source, "A: b\n").unwrap();
        std::fs::write(&source.key_path, cipher::generate_key()).unwrap();

        let resolver = CredentialResolver::new(source);
        assert!(matches!(
            resolver.resolve("A").unwrap_err(),
            BerthError::Credential(CredentialError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_write_store_rejects_non_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_in(dir.path(), "BERTH_TEST_KEY_NONMAP");
        assert!(CredentialResolver::write_store(&source, "- a\n- b\n").is_err());
    }
}
