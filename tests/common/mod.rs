//! Shared fakes for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use berth::backends::{BuildContext, PushOutcome, RegistryLogin};
use berth::config::{ConfigParser, ImageRef};
use berth::credentials::{CredentialResolver, CredentialSource};
use berth::error::RemoteError;
use berth::manifest::{Resource, ResourceKey};
use berth::providers::KubeConfig;
use berth::{ApplyOutcome, ClusterApi, ClusterSession, ImageBuilder};

pub const CLUSTER_ID: &str = "c1";

/// A production definition targeting a DigitalOcean API at `api_url`, with
/// an externally hosted database.
pub fn production(api_url: &str, cluster_id: &str) -> String {
    format!(
        r#"
app "kuby-test"

environment "production" {{
    docker {{
        image_url "docker.io/acme/app"
    }}
    kubernetes {{
        provider "digitalocean" {{
            access_token "t0ken"
            cluster_id "{cluster_id}"
            api_url "{api_url}"
        }}
        add_plugin "rails_app" {{
            hostname "app.example.com"
            database {{
                user "app"
                password "pw"
                host "db.internal"
            }}
        }}
    }}
}}
"#
    )
}

/// Application sources for the build context.
pub fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Dockerfile"), "FROM ruby:3.3\n").unwrap();
    std::fs::write(dir.path().join("Gemfile"), "source 'https://rubygems.org'\n").unwrap();
    dir
}

/// Parser whose credential store does not exist.
pub fn parser() -> ConfigParser {
    let source = CredentialSource::new("/nonexistent/credentials.yml.enc", "/nonexistent/master.key")
        .with_env_key("BERTH_INTEGRATION_UNSET_KEY");
    ConfigParser::new(Arc::new(CredentialResolver::new(source)))
}

/// DigitalOcean API stand-in serving one cluster.
pub async fn digitalocean() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/kubernetes/clusters/{CLUSTER_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "kubernetes_cluster": {
                "id": CLUSTER_ID,
                "name": "production",
                "region": "nyc1",
                "version": "1.29.1-do.0",
                "endpoint": "https://c1.k8s.ondigitalocean.com"
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/kubernetes/clusters/{CLUSTER_ID}/kubeconfig")))
        .respond_with(ResponseTemplate::new(200).set_body_string("apiVersion: v1\nkind: Config\n"))
        .mount(&server)
        .await;
    server
}

/// Image builder that only counts calls.
#[derive(Debug, Default)]
pub struct CountingImages {
    pub builds: AtomicUsize,
    pub pushes: AtomicUsize,
}

impl CountingImages {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBuilder for CountingImages {
    async fn build(&self, _image: &ImageRef, _context: &BuildContext) -> Result<(), RemoteError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push(
        &self,
        _image: &ImageRef,
        _credentials: Option<RegistryLogin>,
    ) -> Result<PushOutcome, RemoteError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(PushOutcome {
            digest: Some(String::from("sha256:0123")),
        })
    }
}

#[derive(Default)]
struct Objects {
    live: HashMap<ResourceKey, serde_json::Value>,
    reject_kinds: HashSet<String>,
}

/// In-memory cluster. Re-applying an identical body is `Unchanged`.
#[derive(Clone, Default)]
pub struct MemoryCluster(Arc<Mutex<Objects>>);

impl MemoryCluster {
    pub fn reject(&self, kind: &str) {
        self.0.lock().unwrap().reject_kinds.insert(kind.to_string());
    }

    pub fn accept_all(&self) {
        self.0.lock().unwrap().reject_kinds.clear();
    }

    pub fn live(&self, kind: &str) -> Vec<serde_json::Value> {
        let objects = self.0.lock().unwrap();
        let mut found: Vec<(&ResourceKey, &serde_json::Value)> =
            objects.live.iter().filter(|(k, _)| k.kind == kind).collect();
        found.sort_by(|a, b| a.0.cmp(b.0));
        found.into_iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().live.len()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn connect(&self, _kubeconfig: &KubeConfig) -> Result<Box<dyn ClusterSession>, RemoteError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl ClusterSession for MemoryCluster {
    async fn apply(&self, resource: &Resource) -> Result<ApplyOutcome, RemoteError> {
        let mut objects = self.0.lock().unwrap();
        if objects.reject_kinds.contains(&resource.kind) {
            return Err(RemoteError::Rejected {
                resource: resource.key().to_string(),
                message: String::from("the server rejected the object"),
            });
        }
        match objects.live.insert(resource.key(), resource.body.clone()) {
            Some(previous) if previous == resource.body => Ok(ApplyOutcome::Unchanged),
            _ => Ok(ApplyOutcome::Applied),
        }
    }
}
