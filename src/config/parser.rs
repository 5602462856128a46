//! Deployment definition evaluator.
//!
//! Definitions are KDL documents made of nested blocks:
//!
//! ```kdl
//! app "kuby-test"
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
//!         provider "digitalocean" { access_token (secret)"DO_TOKEN"; cluster_id "c1" }
//!         add_plugin "rails_app" { hostname "app.example.com" }
//!     }
//! }
//! ```
//!
//! Evaluation keeps an explicit stack of open blocks. Entering a block pushes
//! a frame, and the block's builder yields an immutable struct when the block
//! closes. The stack is what error locations report.

use indexmap::IndexMap;
use kdl::{KdlDocument, KdlEntry, KdlNode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::credentials::CredentialResolver;
use crate::error::{BerthError, ConfigError, Location, Result};

use super::spec::{
    Definition, DockerConfig, Environment, ImageRef, KubernetesConfig, RegistryCredentials,
    Setting, Settings, Value,
};

/// Default Dockerfile name.
const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Default build context.
const DEFAULT_BUILD_CONTEXT: &str = ".";

/// Names that are only valid inside an `environment` block.
const ENVIRONMENT_SCOPED: &[&str] = &[
    "docker",
    "kubernetes",
    "credentials",
    "provider",
    "add_plugin",
    "image_url",
    "username",
    "password",
    "email",
    "namespace",
];

/// Definition parser.
#[derive(Debug)]
pub struct ConfigParser {
    /// Resolves `(secret)` references.
    resolver: Arc<CredentialResolver>,
    /// Base path for `.env` lookup.
    base_path: Option<PathBuf>,
}

/// A definition being accumulated across files.
#[derive(Debug, Default)]
struct DefinitionDraft {
    app: Option<String>,
    environments: IndexMap<String, EnvironmentDraft>,
}

/// An environment before the application name is known.
#[derive(Debug)]
struct EnvironmentDraft {
    name: String,
    docker: DockerConfig,
    kubernetes: KubernetesConfig,
}

impl ConfigParser {
    /// Creates a parser that resolves secrets through `resolver`.
    #[must_use]
    pub const fn new(resolver: Arc<CredentialResolver>) -> Self {
        Self {
            resolver,
            base_path: None,
        }
    }

    /// Sets the base path used to find `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads and evaluates definition files in order. Environments declared
    /// again in a later file replace the earlier declaration entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing, malformed, or incomplete, or a
    /// secret cannot be resolved.
    pub fn load_files(&self, paths: &[PathBuf]) -> Result<Definition> {
        let mut draft = DefinitionDraft::default();

        for path in paths {
            info!("Loading definition from: {}", path.display());
            if !path.exists() {
                return Err(ConfigError::FileNotFound { path: path.clone() }.into());
            }
            let content = std::fs::read_to_string(path)?;
            self.evaluate_into(&mut draft, &content, Some(path))?;
        }

        finish(draft)
    }

    /// Evaluates a single definition from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is malformed or incomplete.
    pub fn parse_str(&self, content: &str, source: Option<&Path>) -> Result<Definition> {
        let mut draft = DefinitionDraft::default();
        self.evaluate_into(&mut draft, content, source)?;
        finish(draft)
    }

    /// Evaluates several sources in order, as if they were separate files.
    ///
    /// # Errors
    ///
    /// Same as [`Self::parse_str`].
    pub fn parse_sources(&self, sources: &[&str]) -> Result<Definition> {
        let mut draft = DefinitionDraft::default();
        for content in sources {
            self.evaluate_into(&mut draft, content, None)?;
        }
        finish(draft)
    }

    fn evaluate_into(
        &self,
        draft: &mut DefinitionDraft,
        content: &str,
        source: Option<&Path>,
    ) -> Result<()> {
        let document: KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
            BerthError::Config(ConfigError::Syntax {
                file: source.map_or_else(|| String::from("<input>"), |p| p.display().to_string()),
                message: e.to_string(),
            })
        })?;

        let mut evaluation = Evaluation {
            resolver: &self.resolver,
            file: source,
            text: content,
            scope: Vec::new(),
        };
        evaluation.document(&document, draft)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                BerthError::Config(ConfigError::Syntax {
                    file: env_path.display().to_string(),
                    message: e.to_string(),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Turns the accumulated draft into an immutable definition.
fn finish(draft: DefinitionDraft) -> Result<Definition> {
    let app = draft.app.ok_or_else(|| ConfigError::MissingField {
        field: String::from("app"),
        location: Location::default(),
    })?;

    let environments = draft
        .environments
        .into_iter()
        .map(|(name, env)| {
            (
                name,
                Environment {
                    name: env.name,
                    app: app.clone(),
                    docker: env.docker,
                    kubernetes: env.kubernetes,
                },
            )
        })
        .collect();

    Ok(Definition { app, environments })
}

impl Definition {
    /// Selects the active environment. Without a name, the only defined
    /// environment is selected.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unknown, or no name is given and the
    /// choice is ambiguous.
    pub fn environment(&self, name: Option<&str>) -> Result<&Environment> {
        if let Some(name) = name {
            return self.environments.get(name).ok_or_else(|| {
                ConfigError::UnknownEnvironment {
                    name: name.to_string(),
                    available: self.environment_names().join(", "),
                }
                .into()
            });
        }

        match self.environments.len() {
            1 => Ok(&self.environments[0]),
            0 => Err(ConfigError::NoEnvironment {
                message: String::from("the definition declares no environments"),
            }
            .into()),
            _ => Err(ConfigError::NoEnvironment {
                message: format!(
                    "choose one of {} with --environment",
                    self.environment_names().join(", ")
                ),
            }
            .into()),
        }
    }

    /// Names of all declared environments.
    #[must_use]
    pub fn environment_names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }
}

/// State of one evaluation pass over one source.
struct Evaluation<'a> {
    resolver: &'a CredentialResolver,
    file: Option<&'a Path>,
    text: &'a str,
    /// Open blocks, outermost first.
    scope: Vec<String>,
}

impl Evaluation<'_> {
    /// Top level: `app` and `environment`.
    fn document(&mut self, document: &KdlDocument, draft: &mut DefinitionDraft) -> Result<()> {
        for node in document.nodes() {
            match node.name().value() {
                "app" => {
                    let app = self.string(node)?;
                    if let Some(previous) = draft.app.replace(app.clone())
                        && previous != app
                    {
                        warn!("App name changed from '{previous}' to '{app}'");
                    }
                }
                "environment" => {
                    let name = self.identifier(node)?;
                    let environment = self.within(format!("environment \"{name}\""), |ev| {
                        ev.environment(node, &name)
                    })?;
                    if draft.environments.contains_key(&name) {
                        info!("Environment '{name}' redeclared, replacing previous declaration");
                    }
                    draft.environments.insert(name, environment);
                }
                other if ENVIRONMENT_SCOPED.contains(&other) => {
                    return Err(ConfigError::OutsideScope {
                        name: other.to_string(),
                        location: self.location(node),
                    }
                    .into());
                }
                other => return Err(self.unknown("block", other, node)),
            }
        }
        Ok(())
    }

    /// `environment "<name>" { docker {..} kubernetes {..} }`
    fn environment(&mut self, node: &KdlNode, name: &str) -> Result<EnvironmentDraft> {
        let mut docker = None;
        let mut kubernetes = None;

        for child in children(node) {
            match child.name().value() {
                "docker" => {
                    docker = Some(self.within(String::from("docker"), |ev| ev.docker(child))?);
                }
                "kubernetes" => {
                    kubernetes =
                        Some(self.within(String::from("kubernetes"), |ev| ev.kubernetes(child))?);
                }
                other => return Err(self.unknown("block", other, child)),
            }
        }

        let docker = docker.ok_or_else(|| self.missing("docker", node))?;
        let kubernetes = kubernetes.ok_or_else(|| self.missing("kubernetes", node))?;

        debug!(
            "Evaluated environment '{name}': {} provider(s), {} plugin(s)",
            kubernetes.providers.len(),
            kubernetes.plugins.len()
        );

        Ok(EnvironmentDraft {
            name: name.to_string(),
            docker,
            kubernetes,
        })
    }

    /// `docker { image_url ..; credentials {..}; dockerfile ..; build_context .. }`
    fn docker(&mut self, node: &KdlNode) -> Result<DockerConfig> {
        let mut image = None;
        let mut credentials = None;
        let mut dockerfile = String::from(DEFAULT_DOCKERFILE);
        let mut build_context = String::from(DEFAULT_BUILD_CONTEXT);

        for child in children(node) {
            match child.name().value() {
                "image_url" => {
                    let url = self.string(child)?;
                    let parsed = ImageRef::parse(&url)
                        .map_err(|e| ConfigError::invalid("image_url", e, self.location(child)))?;
                    image = Some(parsed);
                }
                "credentials" => {
                    credentials = Some(
                        self.within(String::from("credentials"), |ev| ev.credentials(child))?,
                    );
                }
                "dockerfile" => dockerfile = self.string(child)?,
                "build_context" => build_context = self.string(child)?,
                other => return Err(self.unknown("field", other, child)),
            }
        }

        Ok(DockerConfig {
            image: image.ok_or_else(|| self.missing("image_url", node))?,
            credentials,
            dockerfile,
            build_context,
        })
    }

    /// `credentials { username ..; password ..; email .. }`
    fn credentials(&mut self, node: &KdlNode) -> Result<RegistryCredentials> {
        let mut username = None;
        let mut password = None;
        let mut email = None;

        for child in children(node) {
            let slot = match child.name().value() {
                "username" => &mut username,
                "password" => &mut password,
                "email" => &mut email,
                other => return Err(self.unknown("field", other, child)),
            };
            *slot = Some(self.scalar(child)?);
        }

        Ok(RegistryCredentials {
            username: username.ok_or_else(|| self.missing("username", node))?,
            password: password.ok_or_else(|| self.missing("password", node))?,
            email: email.ok_or_else(|| self.missing("email", node))?,
        })
    }

    /// `kubernetes { namespace ..; provider <id> {..}; add_plugin <id> {..} }`
    fn kubernetes(&mut self, node: &KdlNode) -> Result<KubernetesConfig> {
        let mut namespace = None;
        let mut providers: IndexMap<String, Settings> = IndexMap::new();
        let mut plugins: IndexMap<String, Settings> = IndexMap::new();

        for child in children(node) {
            match child.name().value() {
                "namespace" => namespace = Some(self.string(child)?),
                "provider" => {
                    let id = self.identifier(child)?;
                    let settings =
                        self.within(format!("provider \"{id}\""), |ev| ev.settings(child))?;
                    redeclare(&mut providers, "provider", id, settings);
                }
                "add_plugin" => {
                    let id = self.identifier(child)?;
                    let settings =
                        self.within(format!("add_plugin \"{id}\""), |ev| ev.settings(child))?;
                    redeclare(&mut plugins, "plugin", id, settings);
                }
                other => return Err(self.unknown("block", other, child)),
            }
        }

        Ok(KubernetesConfig {
            namespace,
            providers,
            plugins,
        })
    }

    /// Schema-free block: scalar fields and nested blocks.
    fn settings(&mut self, node: &KdlNode) -> Result<Settings> {
        let mut settings = Settings::new();

        for child in children(node) {
            let name = child.name().value().to_string();
            if child.children().is_some() {
                if arguments(child).next().is_some() {
                    return Err(ConfigError::invalid(
                        name,
                        "a block cannot also take a value",
                        self.location(child),
                    )
                    .into());
                }
                let block = self.within(name.clone(), |ev| ev.settings(child))?;
                settings.set(name, Setting::Block(block));
            } else {
                let value = self.scalar(child)?;
                settings.set(name, Setting::Value(value));
            }
        }

        Ok(settings)
    }

    /// Runs `f` with `label` pushed on the scope stack.
    fn within<T>(&mut self, label: String, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.scope.push(label);
        let result = f(self);
        self.scope.pop();
        result
    }

    /// The single value of a field node: literal or secret reference.
    fn scalar(&self, node: &KdlNode) -> Result<Value> {
        let entry = self.single_argument(node)?;
        self.value(entry, node)
    }

    /// The single literal string value of a field node.
    fn string(&self, node: &KdlNode) -> Result<String> {
        match self.scalar(node)? {
            Value::Str(s) => Ok(s),
            other => Err(ConfigError::invalid(
                node.name().value(),
                format!("expected a string literal, found {}", other.kind()),
                self.location(node),
            )
            .into()),
        }
    }

    /// The identifier argument of `environment`, `provider` or `add_plugin`.
    fn identifier(&self, node: &KdlNode) -> Result<String> {
        let entry = self.single_argument(node)?;
        match entry.value().as_string() {
            Some(id) if !id.is_empty() && entry.ty().is_none() => Ok(id.to_string()),
            _ => Err(ConfigError::invalid(
                node.name().value(),
                "expected a non-empty identifier string",
                self.location(node),
            )
            .into()),
        }
    }

    fn single_argument<'n>(&self, node: &'n KdlNode) -> Result<&'n KdlEntry> {
        let field = node.name().value();
        if node.entries().iter().any(|e| e.name().is_some()) {
            return Err(ConfigError::invalid(
                field,
                "properties (key=value) are not supported",
                self.location(node),
            )
            .into());
        }

        let mut args = arguments(node);
        match (args.next(), args.next()) {
            (Some(entry), None) => Ok(entry),
            (None, _) => Err(ConfigError::invalid(field, "expected a value", self.location(node)).into()),
            (Some(_), Some(_)) => Err(ConfigError::invalid(
                field,
                "expected exactly one value",
                self.location(node),
            )
            .into()),
        }
    }

    /// Converts one KDL entry, resolving `(secret)` references.
    fn value(&self, entry: &KdlEntry, node: &KdlNode) -> Result<Value> {
        let field = node.name().value();
        let raw = entry.value();

        if let Some(annotation) = entry.ty() {
            if annotation.value() != "secret" {
                return Err(ConfigError::invalid(
                    field,
                    format!("unknown type annotation '({})'", annotation.value()),
                    self.location(node),
                )
                .into());
            }
            let Some(key) = raw.as_string() else {
                return Err(ConfigError::invalid(
                    field,
                    "secret reference must name a string key",
                    self.location(node),
                )
                .into());
            };
            debug!("Resolving secret '{key}' for '{field}'");
            let value = self.resolver.resolve(key)?;
            return Ok(Value::Secret {
                key: key.to_string(),
                value,
            });
        }

        if let Some(s) = raw.as_string() {
            return Ok(Value::Str(s.to_string()));
        }
        if let Some(b) = raw.as_bool() {
            return Ok(Value::Bool(b));
        }
        if let Some(i) = raw.as_integer() {
            let i = i64::try_from(i).map_err(|_| {
                ConfigError::invalid(field, "integer out of range", self.location(node))
            })?;
            return Ok(Value::Int(i));
        }

        Err(ConfigError::invalid(
            field,
            format!("unsupported value {raw}"),
            self.location(node),
        )
        .into())
    }

    /// Location of `node` with the current block stack.
    fn location(&self, node: &KdlNode) -> Location {
        let offset = node.span().offset().min(self.text.len());
        let before = self.text.get(..offset).unwrap_or_default();
        let line = before.matches('\n').count() + 1;
        let column = before.rfind('\n').map_or(offset, |nl| offset - nl - 1) + 1;

        Location {
            file: self.file.map(Path::to_path_buf),
            line,
            column,
            scope: self.scope.clone(),
        }
    }

    fn unknown(&self, kind: &'static str, name: &str, node: &KdlNode) -> BerthError {
        ConfigError::UnknownNode {
            kind,
            name: name.to_string(),
            location: self.location(node),
        }
        .into()
    }

    fn missing(&self, field: &str, node: &KdlNode) -> BerthError {
        ConfigError::MissingField {
            field: field.to_string(),
            location: self.location(node),
        }
        .into()
    }
}

/// Child nodes of a block, or nothing.
fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(KdlDocument::nodes)
}

/// Positional entries of a node.
fn arguments(node: &KdlNode) -> impl Iterator<Item = &KdlEntry> {
    node.entries().iter().filter(|e| e.name().is_none())
}

/// Inserts a provider or plugin declaration. Redeclaring an id replaces the
/// previous settings and moves the entry to the new declaration position.
fn redeclare(map: &mut IndexMap<String, Settings>, kind: &str, id: String, settings: Settings) {
    if map.shift_remove(&id).is_some() {
        info!("{kind} '{id}' redeclared, replacing previous declaration");
    }
    map.insert(id, settings);
}

/// Default definition file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["berth.kdl", "deploy.kdl"];

/// Finds the definition file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no definition file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found definition file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}
