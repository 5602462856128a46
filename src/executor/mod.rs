//! Deployment executor.
//!
//! Drives one run through `Resolving -> Building -> Pushing -> Applying`.
//! Errors found while resolving the definition abort the run before any
//! external side effect and are returned as `Err`. Failures of external
//! systems end the run in `Failed(stage, cause)` and are reported in the
//! returned [`RunReport`]. Nothing is rolled back.

mod report;
mod state;

pub use report::{ResourceReport, RunReport};
pub use state::{RunState, Stage, Transition};

use futures::stream::{self, StreamExt};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::backends::{
    ApplyOutcome, BuildContext, ClusterApi, ClusterSession, ImageBuilder, RegistryLogin,
};
use crate::config::{ConfigHasher, Environment, ImageRef};
use crate::credentials::SecretString;
use crate::error::{RemoteError, Result};
use crate::manifest::{ManifestBuilder, Resource};

/// Default number of resources applied at once within a tier.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default limit for `docker build`.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default limit for `docker push`.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default limit per cluster call.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Image tag; defaults to a hash of the environment and the build
    /// context.
    pub tag: Option<String>,
    /// Skip `Building` and `Pushing` and apply the existing image.
    pub skip_build: bool,
    /// Limit for the image build.
    pub build_timeout: Duration,
    /// Limit for the image push.
    pub push_timeout: Duration,
    /// Limit for connecting and for each resource application.
    pub apply_timeout: Duration,
    /// Resources applied concurrently within a tier.
    pub concurrency: usize,
    /// Directory the definition's `build_context` and `dockerfile` are
    /// relative to. Defaults to the working directory.
    pub build_context: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tag: None,
            skip_build: false,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            build_context: None,
        }
    }
}

/// Cooperative, cloneable cancellation flag.
///
/// Checked before `Building`, before `Pushing` and before each resource is
/// applied. Calls already in flight run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs deployments.
pub struct DeploymentExecutor {
    builder: ManifestBuilder,
    images: Arc<dyn ImageBuilder>,
    cluster: Arc<dyn ClusterApi>,
    options: RunOptions,
    cancel: CancelSignal,
}

impl fmt::Debug for DeploymentExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentExecutor")
            .field("builder", &self.builder)
            .field("options", &self.options)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl DeploymentExecutor {
    /// Creates an executor with default options.
    #[must_use]
    pub fn new(
        builder: ManifestBuilder,
        images: Arc<dyn ImageBuilder>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        Self {
            builder,
            images,
            cluster,
            options: RunOptions::default(),
            cancel: CancelSignal::new(),
        }
    }

    /// Sets run options.
    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// The signal that cancels this executor's runs.
    #[must_use]
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Run options in use.
    #[must_use]
    pub const fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Image reference a run of `env` deploys.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if no tag is set and the build context cannot
    /// be read.
    pub fn image_for(&self, env: &Environment) -> Result<ImageRef> {
        let tag = match &self.options.tag {
            Some(tag) => tag.clone(),
            None => ConfigHasher::new().default_tag(env, &self.project_root())?,
        };
        Ok(env.docker.image.with_tag(tag))
    }

    fn project_root(&self) -> PathBuf {
        self.options
            .build_context
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Deploys `env`.
    ///
    /// # Errors
    ///
    /// Returns configuration, registry, validation and plugin ordering
    /// errors found while resolving, before anything is built or applied.
    /// Failures of the image toolchain, the provider or the cluster are
    /// not errors here: the report ends in `Failed(stage, cause)`.
    pub async fn run(&self, env: &Environment) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, environment = %env.name);
        self.drive(run_id, env).instrument(span).await
    }

    async fn drive(&self, run_id: Uuid, env: &Environment) -> Result<RunReport> {
        let mut report = RunReport::new(run_id, &env.name);

        report.enter(RunState::Resolving);
        info!("Resolving environment '{}'", env.name);
        let prepared = self.builder.prepare(env)?;
        let image = self.image_for(env)?;
        report.image = Some(image.to_string());

        let resolved = match self.builder.assemble(env, &image, prepared).await {
            Ok(resolved) => resolved,
            Err(e) if e.is_user_fixable() => return Err(e),
            Err(e) => return Ok(failed(report, Stage::Resolving, RemoteError::remote(e.to_string()))),
        };
        report.manifest_digest = Some(resolved.manifest.digest()?);

        if self.options.skip_build {
            info!("Skipping build, deploying existing image {image}");
        } else {
            report.enter(RunState::Building);
            if let Err(cause) = self.build(env, &image).await {
                return Ok(failed(report, Stage::Building, cause));
            }

            report.enter(RunState::Pushing);
            match self.push(env, &image).await {
                Ok(digest) => report.digest = digest,
                Err(cause) => return Ok(failed(report, Stage::Pushing, cause)),
            }
        }

        report.enter(RunState::Applying);
        let connect = self.cluster.connect(&resolved.kubeconfig);
        let session = match with_timeout(self.options.apply_timeout, connect).await {
            Ok(session) => session,
            Err(cause) => return Ok(failed(report, Stage::Applying, cause)),
        };

        for tier in resolved.manifest.tiers() {
            if let Err(cause) = self.apply_tier(session.as_ref(), tier, &mut report).await {
                return Ok(failed(report, Stage::Applying, cause));
            }
        }

        report.enter(RunState::Done);
        info!(
            "Run finished: {} applied, {} unchanged",
            report.count(ApplyOutcome::Applied),
            report.count(ApplyOutcome::Unchanged)
        );
        Ok(report)
    }

    async fn build(&self, env: &Environment, image: &ImageRef) -> std::result::Result<(), RemoteError> {
        self.checkpoint()?;
        let base = self.project_root();
        let context = BuildContext {
            dir: base.join(&env.docker.build_context),
            dockerfile: base.join(&env.docker.dockerfile),
        };
        info!("Building {image}");
        with_timeout(self.options.build_timeout, self.images.build(image, &context)).await
    }

    async fn push(
        &self,
        env: &Environment,
        image: &ImageRef,
    ) -> std::result::Result<Option<String>, RemoteError> {
        self.checkpoint()?;
        info!("Pushing {image}");
        let outcome = with_timeout(
            self.options.push_timeout,
            self.images.push(image, registry_login(env, image)),
        )
        .await?;
        if let Some(digest) = &outcome.digest {
            info!("Pushed {image} ({digest})");
        }
        Ok(outcome.digest)
    }

    /// Applies one tier concurrently. Every started application is awaited
    /// and recorded; the first failure in manifest order is returned.
    async fn apply_tier(
        &self,
        session: &dyn ClusterSession,
        tier: &[Resource],
        report: &mut RunReport,
    ) -> std::result::Result<(), RemoteError> {
        let mut results: Vec<(usize, std::result::Result<ApplyOutcome, RemoteError>)> =
            stream::iter(tier.iter().enumerate())
                .map(|(index, resource)| async move {
                    (index, self.apply_one(session, resource).await)
                })
                .buffer_unordered(self.options.concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);

        let mut failure = None;
        for (index, result) in results {
            let resource = &tier[index];
            match result {
                Ok(outcome) => {
                    info!("{resource} {outcome:?}");
                    report.applied.push(ResourceReport::new(&resource.key(), outcome));
                }
                Err(cause) => {
                    error!("{resource} failed: {cause}");
                    failure.get_or_insert(cause);
                }
            }
        }

        failure.map_or(Ok(()), Err)
    }

    async fn apply_one(
        &self,
        session: &dyn ClusterSession,
        resource: &Resource,
    ) -> std::result::Result<ApplyOutcome, RemoteError> {
        self.checkpoint()?;
        with_timeout(self.options.apply_timeout, session.apply(resource)).await
    }

    fn checkpoint(&self) -> std::result::Result<(), RemoteError> {
        if self.cancel.is_cancelled() {
            warn!("Run cancelled");
            return Err(RemoteError::Cancelled);
        }
        Ok(())
    }
}

fn failed(mut report: RunReport, stage: Stage, cause: RemoteError) -> RunReport {
    error!("{stage} failed: {cause}");
    report.fail(stage, cause);
    report
}

async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = std::result::Result<T, RemoteError>>,
) -> std::result::Result<T, RemoteError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(RemoteError::timeout(limit)))
}

/// Registry login from the definition's docker credentials.
fn registry_login(env: &Environment, image: &ImageRef) -> Option<RegistryLogin> {
    let credentials = env.docker.credentials.as_ref()?;
    Some(RegistryLogin {
        registry: image.registry.clone(),
        username: credentials.username.as_str()?.to_string(),
        password: SecretString::new(credentials.password.as_str()?.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MockImageBuilder, PushOutcome};
    use crate::config::{DockerConfig, KubernetesConfig, RegistryCredentials, Settings, Value};
    use crate::error::{BerthError, Violation};
    use crate::manifest::ResourceKey;
    use crate::plugins::PluginRegistry;
    use crate::providers::{ClusterInfo, KubeConfig, Provider, ProviderRegistry};
    use async_trait::async_trait;
    use crate::plugins::{Plugin, PluginContext, PluginOutput};
    use indexmap::IndexMap;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct FakeProvider;

    #[async_trait]
    impl Provider for FakeProvider {
        fn id(&self) -> &str {
            "fake"
        }
        fn validate(&self) -> Vec<Violation> {
            Vec::new()
        }
        async fn kubeconfig(&self) -> Result<KubeConfig> {
            Ok(KubeConfig {
                context: None,
                contents: String::from("kind: Config\n"),
            })
        }
        async fn describe(&self) -> Result<ClusterInfo> {
            Ok(ClusterInfo::default())
        }
    }

    /// Five ConfigMaps and a Service.
    #[derive(Debug)]
    struct Fanout;

    impl Plugin for Fanout {
        fn id(&self) -> &str {
            "fanout"
        }
        fn validate(&self) -> Vec<Violation> {
            Vec::new()
        }
        fn manifest_fragments(&self, ctx: &PluginContext<'_>) -> Result<PluginOutput> {
            let mut resources: Vec<Resource> = (0..5)
                .map(|i| Resource::new("v1", "ConfigMap", &ctx.name(&format!("part-{i}")), Some(ctx.namespace)))
                .collect();
            resources.push(Resource::new("v1", "Service", &ctx.name("web"), Some(ctx.namespace)));
            Ok(PluginOutput {
                resources,
                exports: std::collections::BTreeMap::new(),
            })
        }
    }

    #[derive(Default)]
    struct Objects {
        live: HashMap<ResourceKey, serde_json::Value>,
        reject_kinds: HashSet<String>,
        delay: Option<Duration>,
        /// Cancels the signal once a resource of this kind is applied.
        cancel_after: Option<(String, CancelSignal)>,
        in_flight: usize,
        max_in_flight: usize,
        /// `start Kind` / `end Kind` in call order.
        events: Vec<String>,
    }

    /// In-memory cluster: identical bodies are `Unchanged`.
    #[derive(Clone, Default)]
    struct MemoryCluster(Arc<Mutex<Objects>>);

    impl MemoryCluster {
        fn reject(&self, kind: &str) {
            self.0.lock().unwrap().reject_kinds.insert(kind.to_string());
        }
        fn accept_all(&self) {
            self.0.lock().unwrap().reject_kinds.clear();
        }
        fn live_count(&self) -> usize {
            self.0.lock().unwrap().live.len()
        }
        fn deployment_image(&self) -> Option<String> {
            let objects = self.0.lock().unwrap();
            let (_, body) = objects.live.iter().find(|(key, _)| key.kind == "Deployment")?;
            body["spec"]["template"]["spec"]["containers"][0]["image"]
                .as_str()
                .map(str::to_string)
        }
    }

    #[async_trait]
    impl ClusterApi for MemoryCluster {
        async fn connect(
            &self,
            _kubeconfig: &KubeConfig,
        ) -> std::result::Result<Box<dyn ClusterSession>, RemoteError> {
            Ok(Box::new(self.clone()))
        }
    }

    #[async_trait]
    impl ClusterSession for MemoryCluster {
        async fn apply(&self, resource: &Resource) -> std::result::Result<ApplyOutcome, RemoteError> {
            let delay = {
                let mut objects = self.0.lock().unwrap();
                objects.in_flight += 1;
                objects.max_in_flight = objects.max_in_flight.max(objects.in_flight);
                objects.events.push(format!("start {}", resource.kind));
                objects.delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut objects = self.0.lock().unwrap();
            objects.in_flight -= 1;
            objects.events.push(format!("end {}", resource.kind));
            if let Some((kind, signal)) = &objects.cancel_after
                && *kind == resource.kind
            {
                signal.cancel();
            }
            if objects.reject_kinds.contains(&resource.kind) {
                return Err(RemoteError::Rejected {
                    resource: resource.key().to_string(),
                    message: String::from("admission webhook denied the request"),
                });
            }
            match objects.live.insert(resource.key(), resource.body.clone()) {
                Some(previous) if previous == resource.body => Ok(ApplyOutcome::Unchanged),
                _ => Ok(ApplyOutcome::Applied),
            }
        }
    }

    fn text(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    fn environment(credentials: bool) -> Environment {
        let mut providers = IndexMap::new();
        providers.insert(String::from("fake"), Settings::new());
        let mut plugins = IndexMap::new();
        plugins.insert(
            String::from("rails_app"),
            Settings::new().with("hostname", text("app.example.com")),
        );
        Environment {
            name: String::from("production"),
            app: String::from("kuby-test"),
            docker: DockerConfig {
                image: ImageRef::parse("docker.io/acme/app").unwrap(),
                credentials: credentials.then(|| RegistryCredentials {
                    username: text("acme"),
                    password: text("hunter2"),
                    email: text("ops@example.com"),
                }),
                dockerfile: String::from("Dockerfile"),
                build_context: String::from("."),
            },
            kubernetes: KubernetesConfig {
                namespace: None,
                providers,
                plugins,
            },
        }
    }

    fn manifest_builder() -> ManifestBuilder {
        let mut providers = ProviderRegistry::with_builtin();
        providers.register("fake", |_| Box::new(FakeProvider));
        let mut plugins = PluginRegistry::with_builtin();
        plugins.register("fanout", |_| Box::new(Fanout));
        ManifestBuilder::new(providers, plugins)
    }

    /// Application sources for the build context.
    fn project() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM ruby:3.3\n").unwrap();
        std::fs::write(dir.path().join("app.rb"), "puts 'v1'\n").unwrap();
        dir
    }

    fn options(project: &TempDir) -> RunOptions {
        RunOptions {
            build_context: Some(project.path().to_path_buf()),
            ..RunOptions::default()
        }
    }

    fn executor(images: MockImageBuilder, cluster: &MemoryCluster, project: &TempDir) -> DeploymentExecutor {
        DeploymentExecutor::new(manifest_builder(), Arc::new(images), Arc::new(cluster.clone()))
            .with_options(options(project))
    }

    fn working_images() -> MockImageBuilder {
        let mut images = MockImageBuilder::new();
        images.expect_build().times(1).returning(|_, _| Ok(()));
        images
            .expect_push()
            .times(1)
            .withf(|_, login| login.as_ref().map(|l| l.username.as_str()) == Some("acme"))
            .returning(|_, _| {
                Ok(PushOutcome {
                    digest: Some(String::from("sha256:feed")),
                })
            });
        images
    }

    #[tokio::test]
    async fn test_full_run_reaches_done() {
        let project = project();
        let cluster = MemoryCluster::default();
        let env = environment(true);
        let report = executor(working_images(), &cluster, &project).run(&env).await.unwrap();

        assert!(report.is_success(), "{}", report.state);
        let states: Vec<String> = report.transitions.iter().map(|t| t.state.to_string()).collect();
        assert_eq!(
            states,
            vec!["Idle", "Resolving", "Building", "Pushing", "Applying", "Done"]
        );
        let tag = ConfigHasher::new().default_tag(&env, project.path()).unwrap();
        assert_eq!(report.image.as_deref(), Some(format!("docker.io/acme/app:{tag}").as_str()));
        assert_eq!(report.digest.as_deref(), Some("sha256:feed"));
        assert_eq!(report.applied.len(), 6);
        assert_eq!(report.applied[0].resource, "Namespace/kuby-test-production");
        assert_eq!(cluster.live_count(), 6);
    }

    #[tokio::test]
    async fn test_source_change_rolls_out_new_image() {
        let project = project();
        let cluster = MemoryCluster::default();
        let env = environment(true);

        let first = executor(working_images(), &cluster, &project).run(&env).await.unwrap();
        assert!(first.is_success());
        let first_image = cluster.deployment_image().unwrap();

        std::fs::write(project.path().join("app.rb"), "puts 'v2'\n").unwrap();
        let second = executor(working_images(), &cluster, &project).run(&env).await.unwrap();
        assert!(second.is_success());

        let second_image = cluster.deployment_image().unwrap();
        assert_ne!(first_image, second_image);
        assert_eq!(second.image.as_deref(), Some(second_image.as_str()));
        let deployment = second
            .applied
            .iter()
            .find(|r| r.resource.starts_with("Deployment/"))
            .unwrap();
        assert_eq!(deployment.outcome, ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_unreadable_build_context_fails_before_building() {
        let mut images = MockImageBuilder::new();
        images.expect_build().never();
        let cluster = MemoryCluster::default();
        let err = DeploymentExecutor::new(manifest_builder(), Arc::new(images), Arc::new(cluster.clone()))
            .with_options(RunOptions {
                build_context: Some(PathBuf::from("/nonexistent/berth/project")),
                ..RunOptions::default()
            })
            .run(&environment(false))
            .await
            .unwrap_err();
        assert!(matches!(err, BerthError::Io(_)));
        assert_eq!(cluster.live_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_apply_then_apply_only_rerun() {
        let project = project();
        let cluster = MemoryCluster::default();
        cluster.reject("Deployment");
        let env = environment(false);

        let mut images = MockImageBuilder::new();
        images.expect_build().times(1).returning(|_, _| Ok(()));
        images
            .expect_push()
            .times(1)
            .withf(|_, login| login.is_none())
            .returning(|_, _| Ok(PushOutcome::default()));
        let report = executor(images, &cluster, &project).run(&env).await.unwrap();

        let (stage, cause) = report.failure().unwrap();
        assert_eq!(stage, Stage::Applying);
        assert!(matches!(cause, RemoteError::Rejected { resource, .. } if resource.starts_with("Deployment/")));
        let applied: Vec<&str> = report.applied.iter().map(|r| r.resource.as_str()).collect();
        assert_eq!(
            applied,
            vec![
                "Namespace/kuby-test-production",
                "ConfigMap/kuby-test-production/kuby-test-config",
                "Service/kuby-test-production/kuby-test-web",
            ]
        );
        assert_eq!(cluster.live_count(), 3);

        cluster.accept_all();
        let rerun = executor(MockImageBuilder::new(), &cluster, &project)
            .with_options(RunOptions {
                skip_build: true,
                ..options(&project)
            })
            .run(&env)
            .await
            .unwrap();

        assert!(rerun.is_success());
        assert!(!rerun.visited(&RunState::Building));
        assert_eq!(rerun.image, report.image);
        assert_eq!(rerun.count(ApplyOutcome::Unchanged), 3);
        assert_eq!(rerun.count(ApplyOutcome::Applied), 2);
    }

    #[tokio::test]
    async fn test_validation_error_never_reaches_building() {
        let project = project();
        let mut env = environment(false);
        env.kubernetes.providers.clear();
        env.kubernetes.providers.insert(
            String::from("digitalocean"),
            Settings::new()
                .with("access_token", text("token"))
                .with("cluster_id", text("")),
        );
        let mut images = MockImageBuilder::new();
        images.expect_build().never();
        images.expect_push().never();
        let cluster = MemoryCluster::default();

        let err = executor(images, &cluster, &project).run(&env).await.unwrap_err();
        let BerthError::Validation(err) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(err.mentions("cluster_id"));
        assert_eq!(cluster.live_count(), 0);
    }

    #[tokio::test]
    async fn test_push_failure_stops_before_applying() {
        let project = project();
        let mut images = MockImageBuilder::new();
        images.expect_build().returning(|_, _| Ok(()));
        images
            .expect_push()
            .returning(|_, _| Err(RemoteError::remote("denied: requested access to the resource is denied")));
        let cluster = MemoryCluster::default();

        let report = executor(images, &cluster, &project)
            .run(&environment(true))
            .await
            .unwrap();
        assert_eq!(report.failure().map(|(stage, _)| stage), Some(Stage::Pushing));
        assert!(!report.visited(&RunState::Applying));
        assert_eq!(cluster.live_count(), 0);
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_cancel_before_building() {
        let project = project();
        let mut images = MockImageBuilder::new();
        images.expect_build().never();
        let cluster = MemoryCluster::default();
        let executor = executor(images, &cluster, &project);
        executor.cancel_signal().cancel();

        let report = executor.run(&environment(false)).await.unwrap();
        assert_eq!(
            report.state,
            RunState::Failed {
                stage: Stage::Building,
                cause: RemoteError::Cancelled,
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_between_resource_applications() {
        let project = project();
        let cluster = MemoryCluster::default();
        let executor = executor(MockImageBuilder::new(), &cluster, &project).with_options(RunOptions {
            skip_build: true,
            concurrency: 1,
            ..options(&project)
        });
        cluster.0.lock().unwrap().cancel_after =
            Some((String::from("ConfigMap"), executor.cancel_signal()));

        let report = executor.run(&environment(false)).await.unwrap();

        assert_eq!(
            report.state,
            RunState::Failed {
                stage: Stage::Applying,
                cause: RemoteError::Cancelled,
            }
        );
        let applied: Vec<&str> = report.applied.iter().map(|r| r.resource.as_str()).collect();
        assert_eq!(
            applied,
            vec![
                "Namespace/kuby-test-production",
                "ConfigMap/kuby-test-production/kuby-test-config",
            ]
        );
        assert_eq!(cluster.live_count(), 2);
        assert!(cluster.deployment_image().is_none());
    }

    #[tokio::test]
    async fn test_tier_concurrency_is_bounded_and_tiers_are_sequential() {
        let project = project();
        let cluster = MemoryCluster::default();
        cluster.0.lock().unwrap().delay = Some(Duration::from_millis(20));
        let mut env = environment(false);
        env.kubernetes.plugins.clear();
        env.kubernetes.plugins.insert(String::from("fanout"), Settings::new());

        let report = executor(MockImageBuilder::new(), &cluster, &project)
            .with_options(RunOptions {
                skip_build: true,
                concurrency: 2,
                ..options(&project)
            })
            .run(&env)
            .await
            .unwrap();
        assert!(report.is_success(), "{}", report.state);
        assert_eq!(report.count(ApplyOutcome::Applied), 7);

        let objects = cluster.0.lock().unwrap();
        assert_eq!(objects.max_in_flight, 2);

        // Every ConfigMap has finished before the Service tier starts.
        let position = |event: &str| objects.events.iter().position(|e| e == event).unwrap();
        let last_configmap_end = objects.events.iter().rposition(|e| e == "end ConfigMap").unwrap();
        assert!(position("end Namespace") < position("start ConfigMap"));
        assert!(last_configmap_end < position("start Service"));
    }

    #[tokio::test]
    async fn test_apply_timeout() {
        let project = project();
        let cluster = MemoryCluster::default();
        cluster.0.lock().unwrap().delay = Some(Duration::from_secs(5));
        let report = executor(MockImageBuilder::new(), &cluster, &project)
            .with_options(RunOptions {
                skip_build: true,
                apply_timeout: Duration::from_millis(20),
                ..options(&project)
            })
            .run(&environment(false))
            .await
            .unwrap();

        assert!(matches!(
            report.failure(),
            Some((Stage::Applying, RemoteError::Timeout { .. }))
        ));
        assert!(report.applied.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_tag_and_build_context() {
        let project = project();
        let mut images = MockImageBuilder::new();
        images
            .expect_build()
            .withf(|image, context| {
                image.tag.as_deref() == Some("v1.2.3")
                    && context.dockerfile == PathBuf::from("/srv/app/Dockerfile")
            })
            .returning(|_, _| Ok(()));
        images.expect_push().returning(|_, _| Ok(PushOutcome::default()));
        let cluster = MemoryCluster::default();

        let report = executor(images, &cluster, &project)
            .with_options(RunOptions {
                tag: Some(String::from("v1.2.3")),
                build_context: Some(PathBuf::from("/srv/app")),
                ..RunOptions::default()
            })
            .run(&environment(false))
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.image.as_deref(), Some("docker.io/acme/app:v1.2.3"));
    }
}
