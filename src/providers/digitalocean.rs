//! DigitalOcean Kubernetes provider.
//!
//! This module provides the HTTP client for the DigitalOcean v2 REST API and
//! the provider built on top of it.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::config::{Settings, SettingsCheck};
use crate::credentials::SecretString;
use crate::error::{BerthError, ProviderError, Result, ValidationError, Violation};

use super::{ClusterInfo, KubeConfig, Provider};

/// Provider identifier.
const ID: &str = "digitalocean";

/// DigitalOcean API base URL.
pub const DEFAULT_API_URL: &str = "https://api.digitalocean.com";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Upper bound for any single wait, including server-requested ones.
const MAX_RETRY_DELAY_SECS: u64 = 30;

/// DigitalOcean API client.
#[derive(Debug, Clone)]
pub struct DigitalOceanClient {
    /// HTTP client.
    client: Client,
    /// API base URL, without trailing slash.
    base_url: String,
    /// API token.
    token: SecretString,
    /// Base delay between retries.
    retry_delay: Duration,
    /// Cap on any delay between retries.
    max_retry_delay: Duration,
}

/// `GET /v2/kubernetes/clusters/{id}` response.
#[derive(Debug, Deserialize)]
struct ClusterResponse {
    kubernetes_cluster: Cluster,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    id: String,
    name: String,
    region: Option<String>,
    version: Option<String>,
    endpoint: Option<String>,
}

/// Error body returned by the API.
#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl DigitalOceanClient {
    /// Creates a new API client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: SecretString) -> Result<Self> {
        Self::with_timeout(base_url, token, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Creates a client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(base_url: &str, token: SecretString, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::network(ID, format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            max_retry_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
        })
    }

    /// Sets the base delay between retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Caps every delay between retries, including `Retry-After`.
    #[must_use]
    pub const fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Performs a GET request, retrying transient failures.
    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let mut attempt = 1;
        loop {
            match self.get_once(path).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = self.backoff(&e, attempt);
                    debug!("Retry attempt {attempt} of {MAX_RETRIES} in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The server's `Retry-After`, else linear backoff, capped.
    fn backoff(&self, error: &BerthError, attempt: u32) -> Duration {
        error
            .retry_delay_secs()
            .map_or(self.retry_delay * attempt, Duration::from_secs)
            .min(self.max_retry_delay)
    }

    /// Performs a single GET request and maps HTTP failures.
    async fn get_once(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        trace!("GET {url}");

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token.expose()))
            .send()
            .await
            .map_err(|e| ProviderError::network(ID, format!("Request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            return Err(ProviderError::RateLimited {
                provider: ID.to_string(),
                retry_after_secs: retry_after,
            }
            .into());
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed {
                provider: ID.to_string(),
                message: String::from("Invalid access token"),
            }
            .into());
        }

        if status.is_server_error() {
            // Gateway hiccups are transient.
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::network(ID, format!("{status}: {body}")).into());
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            return Err(ProviderError::api_error(ID, status.as_u16(), message).into());
        }

        Ok(response)
    }

    /// Fetches one cluster.
    ///
    /// # Errors
    ///
    /// Returns `ClusterNotFound` on 404, or an API error.
    pub async fn get_cluster(&self, cluster_id: &str) -> Result<ClusterInfo> {
        let response = self
            .get(&format!("/v2/kubernetes/clusters/{cluster_id}"))
            .await
            .map_err(|e| not_found(e, cluster_id))?;

        let body: ClusterResponse = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            provider: ID.to_string(),
            message: format!("Failed to parse response: {e}"),
        })?;

        let cluster = body.kubernetes_cluster;
        Ok(ClusterInfo {
            id: cluster.id,
            name: cluster.name,
            region: cluster.region,
            version: cluster.version,
            endpoint: cluster.endpoint,
        })
    }

    /// Fetches the kubeconfig YAML of one cluster.
    ///
    /// # Errors
    ///
    /// Returns `ClusterNotFound` on 404, or an API error.
    pub async fn get_kubeconfig(&self, cluster_id: &str) -> Result<String> {
        let response = self
            .get(&format!("/v2/kubernetes/clusters/{cluster_id}/kubeconfig"))
            .await
            .map_err(|e| not_found(e, cluster_id))?;

        let contents = response.text().await.map_err(|e| ProviderError::InvalidResponse {
            provider: ID.to_string(),
            message: format!("Failed to read kubeconfig: {e}"),
        })?;
        if contents.trim().is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: ID.to_string(),
                message: String::from("empty kubeconfig"),
            }
            .into());
        }
        Ok(contents)
    }
}

fn not_found(err: BerthError, cluster_id: &str) -> BerthError {
    match err {
        BerthError::Provider(ProviderError::ApiRequestFailed { status: 404, .. }) => {
            ProviderError::ClusterNotFound {
                cluster_id: cluster_id.to_string(),
            }
            .into()
        }
        other => other,
    }
}

/// Validated settings of a `provider "digitalocean"` block.
#[derive(Debug, Clone)]
struct Config {
    access_token: SecretString,
    cluster_id: String,
    api_url: String,
}

/// DigitalOcean managed Kubernetes.
#[derive(Debug)]
pub struct DigitalOcean {
    config: std::result::Result<Config, Vec<Violation>>,
}

impl DigitalOcean {
    /// Builds the provider from settings: `access_token` (required),
    /// `cluster_id` (required), `api_url` (optional).
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let mut check = SettingsCheck::new(format!("provider {ID}"), settings);
        let access_token = check.required_str("access_token");
        let cluster_id = check.required_str("cluster_id");
        let api_url = check.optional_str("api_url").unwrap_or(DEFAULT_API_URL);
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            check.push("api_url", "must be an http(s) URL");
        }
        check.allow_only(&["access_token", "cluster_id", "api_url"]);

        let api_url = api_url.to_string();
        let config = match (access_token, cluster_id, check.finish()) {
            (Some(token), Some(cluster_id), violations) if violations.is_empty() => Ok(Config {
                access_token: SecretString::new(token.to_string()),
                cluster_id: cluster_id.to_string(),
                api_url,
            }),
            (_, _, violations) => Err(violations),
        };
        Self { config }
    }

    fn config(&self) -> Result<&Config> {
        self.config.as_ref().map_err(|violations| {
            ValidationError {
                violations: violations.clone(),
            }
            .into()
        })
    }

    fn client(&self) -> Result<(DigitalOceanClient, &Config)> {
        let config = self.config()?;
        let client = DigitalOceanClient::new(&config.api_url, config.access_token.clone())?;
        Ok((client, config))
    }
}

#[async_trait]
impl Provider for DigitalOcean {
    fn id(&self) -> &str {
        ID
    }

    fn validate(&self) -> Vec<Violation> {
        self.config.as_ref().err().cloned().unwrap_or_default()
    }

    async fn kubeconfig(&self) -> Result<KubeConfig> {
        let (client, config) = self.client()?;
        info!("Fetching kubeconfig for cluster {}", config.cluster_id);
        let contents = client.get_kubeconfig(&config.cluster_id).await?;
        Ok(KubeConfig {
            context: None,
            contents,
        })
    }

    async fn describe(&self) -> Result<ClusterInfo> {
        let (client, config) = self.client()?;
        debug!("Describing cluster {}", config.cluster_id);
        client.get_cluster(&config.cluster_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Value;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(api_url: &str) -> Settings {
        Settings::new()
            .with(
                "access_token",
                Value::Secret {
                    key: String::from("DO_TOKEN"),
                    value: SecretString::new(String::from("t0ken")),
                },
            )
            .with("cluster_id", Value::Str(String::from("c1")))
            .with("api_url", Value::Str(api_url.to_string()))
    }

    fn client(server: &MockServer) -> DigitalOceanClient {
        DigitalOceanClient::new(&server.uri(), SecretString::new(String::from("t0ken")))
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
            .with_max_retry_delay(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_describe_cluster() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/kubernetes/clusters/c1"))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kubernetes_cluster": {
                    "id": "c1",
                    "name": "prod",
                    "region": "nyc1",
                    "version": "1.29.1-do.0",
                    "endpoint": "https://c1.k8s.ondigitalocean.com"
                }
            })))
            .mount(&server)
            .await;

        let provider = DigitalOcean::from_settings(&settings(&server.uri()));
        assert!(provider.validate().is_empty());

        let info = provider.describe().await.unwrap();
        assert_eq!(info.name, "prod");
        assert_eq!(info.region.as_deref(), Some("nyc1"));
    }

    #[tokio::test]
    async fn test_kubeconfig() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/kubernetes/clusters/c1/kubeconfig"))
            .respond_with(ResponseTemplate::new(200).set_body_string("apiVersion: v1\nkind: Config\n"))
            .mount(&server)
            .await;

        let provider = DigitalOcean::from_settings(&settings(&server.uri()));
        let kubeconfig = provider.kubeconfig().await.unwrap();
        assert!(kubeconfig.contents.contains("kind: Config"));
        assert_eq!(kubeconfig.context, None);
    }

    #[tokio::test]
    async fn test_retries_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("kind: Config\n"))
            .mount(&server)
            .await;

        let contents = client(&server).get_kubeconfig("c1").await.unwrap();
        assert_eq!(contents, "kind: Config\n");
    }

    #[tokio::test]
    async fn test_rate_limit_waits_for_retry_after_up_to_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("kind: Config\n"))
            .mount(&server)
            .await;

        let client = client(&server).with_max_retry_delay(Duration::from_millis(150));
        let started = std::time::Instant::now();
        client.get_kubeconfig("c1").await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(150), "waited {waited:?}");
        assert!(waited < Duration::from_secs(10), "waited {waited:?}");
    }

    #[test]
    fn test_backoff() {
        let client = DigitalOceanClient::new("http://localhost", SecretString::new(String::new()))
            .unwrap()
            .with_retry_delay(Duration::from_millis(100));
        let network = BerthError::from(ProviderError::network(ID, "reset"));
        assert_eq!(client.backoff(&network, 2), Duration::from_millis(200));

        let limited = BerthError::from(ProviderError::RateLimited {
            provider: ID.to_string(),
            retry_after_secs: 600,
        });
        assert_eq!(client.backoff(&limited, 1), Duration::from_secs(MAX_RETRY_DELAY_SECS));
    }

    #[tokio::test]
    async fn test_not_found_and_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/kubernetes/clusters/missing"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"id": "not_found", "message": "not found"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/kubernetes/clusters/private"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(matches!(
            client.get_cluster("missing").await.unwrap_err(),
            BerthError::Provider(ProviderError::ClusterNotFound { .. })
        ));
        assert!(matches!(
            client.get_cluster("private").await.unwrap_err(),
            BerthError::Provider(ProviderError::AuthenticationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(u64::from(MAX_RETRIES))
            .mount(&server)
            .await;

        let err = client(&server).get_cluster("c1").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_collects_all_violations() {
        let settings = Settings::new()
            .with("cluster_id", Value::Int(3))
            .with("api_url", Value::Str(String::from("ftp://example.com")))
            .with("region", Value::Str(String::from("nyc1")));
        let fields: Vec<String> = DigitalOcean::from_settings(&settings)
            .validate()
            .into_iter()
            .map(|v| v.field)
            .collect();
        assert_eq!(fields, vec!["access_token", "cluster_id", "api_url", "region"]);
    }
}
