//! In-cluster PostgreSQL.

use serde_json::json;
use std::collections::BTreeMap;

use crate::config::{Settings, SettingsCheck};
use crate::credentials::SecretString;
use crate::error::{Result, Violation};
use crate::manifest::Resource;

use super::{Plugin, PluginContext, PluginOutput, database_url};

const ID: &str = "postgres";

/// PostgreSQL port.
const PORT: u16 = 5432;

const DEFAULT_STORAGE: &str = "10Gi";
const DEFAULT_VERSION: i64 = 16;

/// A single-replica PostgreSQL StatefulSet with its Service and Secret.
///
/// Exports `host`, `port`, `database`, `secret_name`, plus the secret keys
/// holding the user, password and connection URL (`user_key`,
/// `password_key`, `url_key`).
#[derive(Debug)]
pub struct Postgres {
    user: SecretString,
    password: SecretString,
    database: Option<String>,
    storage: String,
    version: i64,
    violations: Vec<Violation>,
}

impl Postgres {
    /// Builds the plugin from settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let mut check = SettingsCheck::new(format!("plugin {ID}"), settings);
        let user = check.required_str("user").unwrap_or_default();
        let password = check.required_str("password").unwrap_or_default();
        let database = check.optional_str("database").map(str::to_string);
        let storage = check
            .optional_str("storage")
            .unwrap_or(DEFAULT_STORAGE)
            .to_string();
        if !is_quantity(&storage) {
            check.push("storage", format!("'{storage}' is not a storage quantity such as 10Gi"));
        }
        let version = check.optional_int("version", 9..=99).unwrap_or(DEFAULT_VERSION);
        check.allow_only(&["user", "password", "database", "storage", "version"]);

        Self {
            user: SecretString::new(user.to_string()),
            password: SecretString::new(password.to_string()),
            database,
            storage,
            version,
            violations: check.finish(),
        }
    }

    /// A database owned by another plugin, with default storage and version.
    #[must_use]
    pub fn owned(user: SecretString, password: SecretString, database: Option<String>) -> Self {
        Self {
            user,
            password,
            database,
            storage: DEFAULT_STORAGE.to_string(),
            version: DEFAULT_VERSION,
            violations: Vec::new(),
        }
    }
}

/// `10Gi`, `500Mi`, `1T`...
fn is_quantity(value: &str) -> bool {
    let digits = value.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let unit = &value[digits.len()..];
    !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
        && matches!(unit, "" | "Ki" | "Mi" | "Gi" | "Ti" | "K" | "M" | "G" | "T")
}

impl Plugin for Postgres {
    fn id(&self) -> &str {
        ID
    }

    fn validate(&self) -> Vec<Violation> {
        self.violations.clone()
    }

    fn manifest_fragments(&self, ctx: &PluginContext<'_>) -> Result<PluginOutput> {
        let name = ctx.name("postgres");
        let database = self.database.clone().unwrap_or_else(|| {
            format!("{}_{}", ctx.app, ctx.environment).replace('-', "_")
        });
        let selector = json!({
            "app.kubernetes.io/name": ctx.app,
            "app.kubernetes.io/component": "database",
        });
        let host = format!("{name}.{}.svc.cluster.local", ctx.namespace);
        let url = database_url(self.user.expose(), self.password.expose(), &host, PORT, &database);

        let secret = Resource::new("v1", "Secret", &name, Some(ctx.namespace))
            .with("type", json!("Opaque"))
            .with(
                "stringData",
                json!({
                    "POSTGRES_USER": self.user.expose(),
                    "POSTGRES_PASSWORD": self.password.expose(),
                    "POSTGRES_DB": database,
                    "DATABASE_URL": url,
                }),
            );

        let service = Resource::new("v1", "Service", &name, Some(ctx.namespace)).with(
            "spec",
            json!({
                "selector": selector,
                "ports": [{ "name": "postgres", "port": PORT, "targetPort": PORT }],
            }),
        );

        let statefulset = Resource::new("apps/v1", "StatefulSet", &name, Some(ctx.namespace)).with(
            "spec",
            json!({
                "serviceName": name,
                "replicas": 1,
                "selector": { "matchLabels": selector },
                "template": {
                    "metadata": { "labels": selector },
                    "spec": {
                        "containers": [{
                            "name": "postgres",
                            "image": format!("postgres:{}", self.version),
                            "envFrom": [{ "secretRef": { "name": name } }],
                            "env": [{ "name": "PGDATA", "value": "/var/lib/postgresql/data/pgdata" }],
                            "ports": [{ "name": "postgres", "containerPort": PORT }],
                            "readinessProbe": {
                                "exec": { "command": ["pg_isready", "-U", self.user.expose()] },
                                "periodSeconds": 10,
                            },
                            "volumeMounts": [{ "name": "data", "mountPath": "/var/lib/postgresql/data" }],
                        }],
                    },
                },
                "volumeClaimTemplates": [{
                    "metadata": { "name": "data" },
                    "spec": {
                        "accessModes": ["ReadWriteOnce"],
                        "resources": { "requests": { "storage": self.storage } },
                    },
                }],
            }),
        );

        let exports = BTreeMap::from([
            (String::from("host"), host),
            (String::from("port"), PORT.to_string()),
            (String::from("database"), database),
            (String::from("secret_name"), name),
            (String::from("user_key"), String::from("POSTGRES_USER")),
            (String::from("password_key"), String::from("POSTGRES_PASSWORD")),
            (String::from("url_key"), String::from("DATABASE_URL")),
        ]);

        Ok(PluginOutput {
            resources: vec![secret, service, statefulset],
            exports,
        })
    }
}
