//! Rails web application: Deployment, Service and Ingress for the built image.
//!
//! The database comes from one of three places:
//!
//! - `database { .. host "db.example.com" }`: an external server, reached
//!   through a `DATABASE_URL` in the app's Secret;
//! - `database { user .. password .. }` without `host`: a PostgreSQL
//!   StatefulSet owned by this plugin;
//! - `manage_database #true`: the `postgres` plugin declared earlier.

use serde_json::{Value as Json, json};
use std::collections::BTreeMap;

use crate::config::{Setting, Settings, SettingsCheck, Value};
use crate::credentials::SecretString;
use crate::error::{BerthError, Result, Violation};
use crate::manifest::Resource;

use super::{Plugin, PluginContext, PluginOutput, Postgres, database_url};

const ID: &str = "rails_app";

/// Plugin that provides the managed database.
const DATABASE_PLUGIN: &str = "postgres";

const DEFAULT_INGRESS_CLASS: &str = "nginx";
const DEFAULT_PORT: i64 = 3000;
const DEFAULT_DATABASE_PORT: i64 = 5432;

/// Externally hosted database connection.
#[derive(Debug, Clone)]
struct ExternalDatabase {
    user: String,
    password: String,
    host: String,
    port: i64,
    name: Option<String>,
}

/// Where the application's database lives.
#[derive(Debug)]
enum Database {
    External(ExternalDatabase),
    Owned(Postgres),
}

/// The Rails application plugin.
#[derive(Debug)]
pub struct RailsApp {
    hostname: String,
    ingress_class: String,
    replicas: i64,
    port: i64,
    manage_database: bool,
    database: Option<Database>,
    /// Plain environment variables.
    env: BTreeMap<String, String>,
    /// Environment variables resolved from secrets.
    secret_env: BTreeMap<String, String>,
    violations: Vec<Violation>,
}

impl RailsApp {
    /// Builds the plugin from settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let mut check = SettingsCheck::new(format!("plugin {ID}"), settings);

        let hostname = check.required_str("hostname").unwrap_or_default().to_string();
        if !hostname.is_empty() && !is_hostname(&hostname) {
            check.push("hostname", format!("'{hostname}' is not a valid host name"));
        }
        let ingress_class = check
            .optional_str("ingress_class")
            .unwrap_or(DEFAULT_INGRESS_CLASS)
            .to_string();
        let replicas = check.optional_int("replicas", 0..=100).unwrap_or(1);
        let port = check.optional_int("port", 1..=65_535).unwrap_or(DEFAULT_PORT);
        // Unset means "decided by the database block".
        let manage_database = check.optional_bool("manage_database");

        let mut database = None;
        check.optional_block("database", |db| {
            if manage_database == Some(true) {
                for field in ["user", "password", "host", "port", "name"] {
                    if db.optional_str(field).is_some() {
                        db.push(field, "is provided by the postgres plugin when manage_database is set");
                    }
                }
                return;
            }
            let user = db.required_str("user");
            let password = db.required_str("password");
            // An explicit `manage_database #false` promises an external host.
            let host = if manage_database == Some(false) {
                db.required_str("host")
            } else {
                db.optional_str("host")
            };
            let port = db.optional_int("port", 1..=65_535);
            if host.is_none() && port.is_some() {
                db.push("port", "only applies together with host");
            }
            let name = db.optional_str("name").map(str::to_string);
            db.allow_only(&["user", "password", "host", "port", "name"]);

            let (Some(user), Some(password)) = (user, password) else {
                return;
            };
            database = match host {
                Some(host) => Some(Database::External(ExternalDatabase {
                    user: user.to_string(),
                    password: password.to_string(),
                    host: host.to_string(),
                    port: port.unwrap_or(DEFAULT_DATABASE_PORT),
                    name,
                })),
                None if manage_database.is_none() => Some(Database::Owned(Postgres::owned(
                    SecretString::new(user.to_string()),
                    SecretString::new(password.to_string()),
                    name,
                ))),
                None => None,
            };
        });
        let manage_database = manage_database.unwrap_or(false);

        let mut env = BTreeMap::new();
        let mut secret_env = BTreeMap::new();
        if let Some(block) = settings.block("env") {
            for (key, setting) in block.iter() {
                match setting {
                    Setting::Value(value @ Value::Secret { .. }) => {
                        secret_env.insert(key.clone(), value.as_str().unwrap_or_default().to_string());
                    }
                    Setting::Value(Value::Str(s)) => {
                        env.insert(key.clone(), s.clone());
                    }
                    Setting::Value(Value::Int(i)) => {
                        env.insert(key.clone(), i.to_string());
                    }
                    Setting::Value(Value::Bool(b)) => {
                        env.insert(key.clone(), b.to_string());
                    }
                    Setting::Block(_) => check.push(&format!("env.{key}"), "expected a value, found a block"),
                }
            }
        } else if settings.get("env").is_some() {
            check.push("env", "expected a block");
        }

        check.allow_only(&[
            "hostname",
            "ingress_class",
            "replicas",
            "port",
            "manage_database",
            "database",
            "env",
        ]);

        Self {
            hostname,
            ingress_class,
            replicas,
            port,
            manage_database,
            database,
            env,
            secret_env,
            violations: check.finish(),
        }
    }

    /// Environment entries that read the connection from a PostgreSQL
    /// plugin's secret.
    fn database_env(exports: Option<&BTreeMap<String, String>>) -> Result<Vec<Json>> {
        let export = |key: &str| {
            exports.and_then(|e| e.get(key)).ok_or_else(|| {
                BerthError::internal(format!("{DATABASE_PLUGIN} plugin did not export '{key}'"))
            })
        };
        let secret = export("secret_name")?;
        let secret_ref = |key: &str| json!({ "secretKeyRef": { "name": secret, "key": key } });

        Ok(vec![
            json!({ "name": "DATABASE_USER", "valueFrom": secret_ref(export("user_key")?) }),
            json!({ "name": "DATABASE_PASSWORD", "valueFrom": secret_ref(export("password_key")?) }),
            json!({ "name": "DATABASE_URL", "valueFrom": secret_ref(export("url_key")?) }),
        ])
    }
}

/// DNS host name: dot separated labels of alphanumerics and hyphens.
fn is_hostname(host: &str) -> bool {
    host.len() <= 253
        && host.contains('.')
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

impl Plugin for RailsApp {
    fn id(&self) -> &str {
        ID
    }

    fn requires(&self) -> Vec<String> {
        if self.manage_database {
            vec![String::from(DATABASE_PLUGIN)]
        } else {
            Vec::new()
        }
    }

    fn validate(&self) -> Vec<Violation> {
        self.violations.clone()
    }

    fn manifest_fragments(&self, ctx: &PluginContext<'_>) -> Result<PluginOutput> {
        let web = ctx.name("web");
        let config_name = ctx.name("config");
        let secret_name = ctx.name("secrets");
        let selector = json!({
            "app.kubernetes.io/name": ctx.app,
            "app.kubernetes.io/component": "web",
        });

        let mut config = BTreeMap::from([
            (String::from("RAILS_ENV"), ctx.environment.to_string()),
            (String::from("RACK_ENV"), ctx.environment.to_string()),
            (String::from("RAILS_LOG_TO_STDOUT"), String::from("true")),
            (String::from("RAILS_SERVE_STATIC_FILES"), String::from("true")),
            (String::from("PORT"), self.port.to_string()),
        ]);
        config.extend(self.env.clone());

        let mut resources = Vec::new();
        let mut secrets = self.secret_env.clone();
        let mut env = Vec::new();
        match &self.database {
            Some(Database::External(db)) => {
                let name = db.name.clone().unwrap_or_else(|| {
                    format!("{}_{}", ctx.app, ctx.environment).replace('-', "_")
                });
                secrets.insert(
                    String::from("DATABASE_URL"),
                    database_url(&db.user, &db.password, &db.host, db.port, &name),
                );
            }
            Some(Database::Owned(postgres)) => {
                let owned = postgres.manifest_fragments(ctx)?;
                env = Self::database_env(Some(&owned.exports))?;
                resources.extend(owned.resources);
            }
            None if self.manage_database => {
                env = Self::database_env(ctx.outputs.get(DATABASE_PLUGIN).map(|o| &o.exports))?;
            }
            None => {}
        }

        resources.push(
            Resource::new("v1", "ConfigMap", &config_name, Some(ctx.namespace))
                .with("data", json!(config)),
        );

        let mut env_from = vec![json!({ "configMapRef": { "name": config_name } })];
        if !secrets.is_empty() {
            resources.push(
                Resource::new("v1", "Secret", &secret_name, Some(ctx.namespace))
                    .with("type", json!("Opaque"))
                    .with("stringData", json!(secrets)),
            );
            env_from.push(json!({ "secretRef": { "name": secret_name } }));
        }

        let mut pod_spec = json!({
            "containers": [{
                "name": "web",
                "image": ctx.image.to_string(),
                "ports": [{ "name": "http", "containerPort": self.port }],
                "envFrom": env_from,
                "env": env,
                "readinessProbe": {
                    "tcpSocket": { "port": self.port },
                    "initialDelaySeconds": 5,
                    "periodSeconds": 10,
                },
            }],
        });
        if let Some(pull_secret) = ctx.registry_secret {
            pod_spec["imagePullSecrets"] = json!([{ "name": pull_secret }]);
        }

        resources.push(
            Resource::new("apps/v1", "Deployment", &web, Some(ctx.namespace)).with(
                "spec",
                json!({
                    "replicas": self.replicas,
                    "selector": { "matchLabels": selector },
                    "template": {
                        "metadata": { "labels": selector },
                        "spec": pod_spec,
                    },
                }),
            ),
        );

        resources.push(
            Resource::new("v1", "Service", &web, Some(ctx.namespace)).with(
                "spec",
                json!({
                    "selector": selector,
                    "ports": [{ "name": "http", "port": 80, "targetPort": self.port }],
                }),
            ),
        );

        resources.push(
            Resource::new("networking.k8s.io/v1", "Ingress", &web, Some(ctx.namespace)).with(
                "spec",
                json!({
                    "ingressClassName": self.ingress_class,
                    "rules": [{
                        "host": self.hostname,
                        "http": {
                            "paths": [{
                                "path": "/",
                                "pathType": "Prefix",
                                "backend": { "service": { "name": web, "port": { "number": 80 } } },
                            }],
                        },
                    }],
                }),
            ),
        );

        let exports = BTreeMap::from([
            (String::from("service"), web),
            (String::from("url"), format!("https://{}", self.hostname)),
        ]);

        Ok(PluginOutput { resources, exports })
    }
}
