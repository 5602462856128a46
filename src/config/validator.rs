//! Validation of evaluated environments and provider/plugin settings.
//!
//! Nothing here fails fast: every check appends a [`Violation`] so one pass
//! reports all problems at once.

use std::ops::RangeInclusive;
use tracing::debug;

use crate::error::{BerthError, ValidationError, Violation};

use super::spec::{Environment, Setting, Settings, Value};

/// Maximum length of a Kubernetes object name or namespace.
pub const MAX_NAME_LEN: usize = 63;

/// Environment-level validator.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all violations and warnings found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Fatal violations.
    pub violations: Vec<Violation>,
    /// Non-fatal issues, logged by the caller.
    pub warnings: Vec<String>,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Checks the parts of an environment that do not belong to a provider
    /// or plugin.
    #[must_use]
    pub fn check(&self, env: &Environment) -> ValidationResult {
        let mut result = ValidationResult::default();
        let subject = format!("environment {}", env.name);

        if !is_valid_name(&env.app) {
            result.violations.push(Violation::new(
                &subject,
                "app",
                format!(
                    "'{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    env.app
                ),
            ));
        }

        let namespace = env.namespace();
        if !is_valid_name(&namespace) || namespace.len() > MAX_NAME_LEN {
            result.violations.push(Violation::new(
                &subject,
                "kubernetes.namespace",
                format!("'{namespace}' is not a valid namespace name"),
            ));
        }

        if let Some(credentials) = &env.docker.credentials {
            for (field, value) in [
                ("username", &credentials.username),
                ("password", &credentials.password),
                ("email", &credentials.email),
            ] {
                if value.as_str().is_none_or(str::is_empty) {
                    result.violations.push(Violation::new(
                        &subject,
                        format!("docker.credentials.{field}"),
                        format!("expected a non-empty string, found {}", value.kind()),
                    ));
                }
            }
        }

        if env.docker.image.tag.is_some() {
            result.warnings.push(format!(
                "{subject}: docker.image_url: tag '{}' is replaced by the deploy tag",
                env.docker.image.tag.as_deref().unwrap_or_default()
            ));
        }

        if env.kubernetes.providers.is_empty() {
            result.violations.push(Violation::new(
                &subject,
                "kubernetes.provider",
                "no provider declared",
            ));
        }

        debug!(
            "Environment checks for '{}': {} violation(s), {} warning(s)",
            env.name,
            result.violations.len(),
            result.warnings.len()
        );
        result
    }
}

impl ValidationResult {
    /// Converts to an error when any violation was recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] listing every violation.
    pub fn into_result(self) -> Result<Vec<String>, BerthError> {
        if self.violations.is_empty() {
            Ok(self.warnings)
        } else {
            Err(ValidationError {
                violations: self.violations,
            }
            .into())
        }
    }
}

/// Typed reader over a schema-free settings block that records a violation
/// for every missing, mistyped or unknown field instead of failing.
#[derive(Debug)]
pub struct SettingsCheck<'a> {
    subject: String,
    prefix: String,
    settings: &'a Settings,
    violations: Vec<Violation>,
}

impl<'a> SettingsCheck<'a> {
    /// Starts checking `settings` on behalf of `subject`
    /// (e.g. `provider digitalocean`).
    #[must_use]
    pub fn new(subject: impl Into<String>, settings: &'a Settings) -> Self {
        Self {
            subject: subject.into(),
            prefix: String::new(),
            settings,
            violations: Vec::new(),
        }
    }

    fn path(&self, field: &str) -> String {
        format!("{}{field}", self.prefix)
    }

    /// Records a violation for `field`.
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        let path = self.path(field);
        self.violations
            .push(Violation::new(&self.subject, path, message));
    }

    fn scalar(&mut self, field: &str, required: bool) -> Option<&'a Value> {
        match self.settings.get(field) {
            Some(Setting::Value(value)) => Some(value),
            Some(Setting::Block(_)) => {
                self.push(field, "expected a value, found a block");
                None
            }
            None => {
                if required {
                    self.push(field, "is required");
                }
                None
            }
        }
    }

    fn string(&mut self, field: &str, required: bool) -> Option<&'a str> {
        let value = self.scalar(field, required)?;
        match value.as_str() {
            Some("") => {
                self.push(field, "must not be empty");
                None
            }
            Some(s) => Some(s),
            None => {
                self.push(field, format!("expected a string, found {}", value.kind()));
                None
            }
        }
    }

    /// A required, non-empty string or secret.
    pub fn required_str(&mut self, field: &str) -> Option<&'a str> {
        self.string(field, true)
    }

    /// An optional, non-empty string or secret.
    pub fn optional_str(&mut self, field: &str) -> Option<&'a str> {
        self.string(field, false)
    }

    /// An optional integer within `range`.
    pub fn optional_int(&mut self, field: &str, range: RangeInclusive<i64>) -> Option<i64> {
        let value = self.scalar(field, false)?;
        let Some(i) = value.as_int() else {
            self.push(field, format!("expected an integer, found {}", value.kind()));
            return None;
        };
        if !range.contains(&i) {
            self.push(
                field,
                format!("{i} is out of range {}..={}", range.start(), range.end()),
            );
            return None;
        }
        Some(i)
    }

    /// An optional boolean.
    pub fn optional_bool(&mut self, field: &str) -> Option<bool> {
        let value = self.scalar(field, false)?;
        let b = value.as_bool();
        if b.is_none() {
            self.push(field, format!("expected a boolean, found {}", value.kind()));
        }
        b
    }

    /// An optional nested block, checked with its own reader whose
    /// violations are folded into this one.
    pub fn optional_block(
        &mut self,
        field: &str,
        check: impl FnOnce(&mut SettingsCheck<'a>),
    ) -> bool {
        match self.settings.get(field) {
            Some(Setting::Block(block)) => {
                let mut nested = SettingsCheck {
                    subject: self.subject.clone(),
                    prefix: format!("{}{field}.", self.prefix),
                    settings: block,
                    violations: Vec::new(),
                };
                check(&mut nested);
                self.violations.append(&mut nested.violations);
                true
            }
            Some(Setting::Value(_)) => {
                self.push(field, "expected a block");
                false
            }
            None => false,
        }
    }

    /// Records a violation for every field not in `known`.
    pub fn allow_only(&mut self, known: &[&str]) {
        let unknown: Vec<String> = self
            .settings
            .iter()
            .map(|(name, _)| name.clone())
            .filter(|name| !known.contains(&name.as_str()))
            .collect();
        for name in unknown {
            self.push(&name, "unknown setting");
        }
    }

    /// Returns the recorded violations.
    #[must_use]
    pub fn finish(self) -> Vec<Violation> {
        self.violations
    }
}

/// Validates that a name follows the Kubernetes naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    if chars.any(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-') {
        return false;
    }

    !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{DockerConfig, ImageRef, KubernetesConfig, RegistryCredentials};
    use indexmap::IndexMap;

    fn environment(app: &str) -> Environment {
        let mut providers = IndexMap::new();
        providers.insert(String::from("docker_desktop"), Settings::new());
        Environment {
            name: String::from("production"),
            app: app.to_string(),
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
    fn test_valid_name() {
        assert!(is_valid_name("kuby-test"));
        assert!(is_valid_name("app-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Kuby")); // uppercase
        assert!(!is_valid_name("1app")); // starts with number
        assert!(!is_valid_name("kuby_test")); // underscore
        assert!(!is_valid_name("app-")); // ends with hyphen
    }

    #[test]
    fn test_environment_checks() {
        let validator = ConfigValidator::new();
        assert!(validator.check(&environment("kuby-test")).violations.is_empty());

        let mut env = environment("Kuby_Test");
        env.kubernetes.providers.clear();
        env.docker.credentials = Some(RegistryCredentials {
            username: Value::Str(String::from("u")),
            password: Value::Int(3),
            email: Value::Str(String::new()),
        });
        let result = validator.check(&env);
        let fields: Vec<&str> = result.violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "app",
                "kubernetes.namespace",
                "docker.credentials.password",
                "docker.credentials.email",
                "kubernetes.provider",
            ]
        );
        assert!(result.into_result().is_err());
    }

    #[test]
    fn test_settings_check_collects_everything() {
        let settings = Settings::new()
            .with("replicas", Value::Str(String::from("two")))
            .with("colour", Value::Str(String::from("blue")))
            .with_block(
                "database",
                Settings::new().with("port", Value::Int(99_999)),
            );

        let mut check = SettingsCheck::new("plugin rails_app", &settings);
        assert_eq!(check.required_str("hostname"), None);
        assert_eq!(check.optional_int("replicas", 1..=100), None);
        assert!(check.optional_block("database", |db| {
            db.optional_int("port", 1..=65_535);
        }));
        check.allow_only(&["hostname", "replicas", "database"]);

        let violations = check.finish();
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["hostname", "replicas", "database.port", "colour"]);
        assert!(violations.iter().all(|v| v.subject == "plugin rails_app"));
    }
}
