//! Release lifecycle: create, read, update, delete, import
//!
//! Every operation connects through a [`ClusterProvider`], resolves the
//! chart when it needs one, and drives a [`ReleaseEngine`]. Engine failures
//! are classified and enriched before they are returned.

use async_trait::async_trait;
use berth_core::{LoadedChart, ReleaseSpec, ReleaseStatus, TrackedRelease, Values, generate_release_id};
use berth_repo::{BasicAuth, ChartResolver, ChartSource, ResolveOptions, TlsSettings};
use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::{ClientGetter, ClusterClient};
use crate::connection::{ClientCache, ConnectionConfig};
use crate::diagnostics::{KubePodLister, Operation, OperationContext, PodLister, diagnose};
use crate::drift::{Drift, detect_drift};
use crate::engine::{
    ApplyPolicy, InstallRequest, KubeEngine, ReleaseEngine, UninstallRequest, UpgradeRequest, WaitStrategy,
};
use crate::error::{KubeError, Result};
use crate::import::ImportId;

/// What a connected cluster offers the lifecycle
#[derive(Clone)]
pub struct ClusterHandle {
    pub engine: Arc<dyn ReleaseEngine>,
    /// Used for diagnostics only
    pub pods: Option<Arc<dyn PodLister>>,
}

#[async_trait]
pub trait ClusterProvider: Send + Sync {
    async fn connect(&self, connection: &ConnectionConfig) -> Result<ClusterHandle>;
}

/// Real clusters, one cached client per connection fingerprint
#[derive(Default)]
pub struct KubeClusterProvider {
    cache: ClientCache<ClusterClient>,
}

impl KubeClusterProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterProvider for KubeClusterProvider {
    async fn connect(&self, connection: &ConnectionConfig) -> Result<ClusterHandle> {
        let client = self
            .cache
            .get_or_try_insert_with(&connection.fingerprint(), || ClusterClient::connect(connection.clone()))
            .await?;
        let pods = KubePodLister::new(client.client());
        let getter: Arc<dyn ClientGetter> = client;
        Ok(ClusterHandle {
            engine: Arc::new(KubeEngine::new(getter)),
            pods: Some(Arc::new(pods)),
        })
    }
}

/// Result of reading a tracked release back from the cluster
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Present {
        release: TrackedRelease,
        drift: Vec<Drift>,
        warnings: Vec<String>,
    },
    /// The release no longer exists and should be forgotten
    Gone,
}

/// An adopted release with what could not be recovered
#[derive(Debug, Clone, PartialEq)]
pub struct Imported {
    pub release: TrackedRelease,
    pub warnings: Vec<String>,
}

pub struct ReleaseLifecycle {
    provider: Arc<dyn ClusterProvider>,
    /// Connection every spec's context is layered onto
    base_connection: ConnectionConfig,
}

impl ReleaseLifecycle {
    pub fn new(provider: Arc<dyn ClusterProvider>, base_connection: ConnectionConfig) -> Self {
        Self {
            provider,
            base_connection,
        }
    }

    fn connection_for(&self, context: Option<&str>) -> ConnectionConfig {
        let mut connection = self.base_connection.clone();
        if let Some(context) = context {
            connection.context = Some(context.to_string());
        }
        connection
    }

    async fn connect(&self, spec: &ReleaseSpec) -> Result<ClusterHandle> {
        self.provider
            .connect(&self.connection_for(spec.kube_context.as_deref()))
            .await
    }

    /// Checks that need no cluster, run before anything touches one
    fn preflight(spec: &ReleaseSpec) -> Result<Values> {
        let values = spec.merged_values()?;
        ChartSource::validate(&spec.chart, &resolve_options(spec))?;
        Ok(values)
    }

    async fn resolve(&self, spec: &ReleaseSpec) -> Result<LoadedChart> {
        let resolver = ChartResolver::new(resolve_options(spec))?;
        Ok(resolver.resolve(&spec.chart).await?)
    }

    async fn enrich(&self, error: KubeError, operation: Operation, spec: &ReleaseSpec, handle: &ClusterHandle) -> KubeError {
        if error.is_configuration() || matches!(error, KubeError::ReleaseNotFound { .. }) {
            return error;
        }
        let context = OperationContext {
            operation,
            release: spec.name.clone(),
            namespace: spec.namespace.clone(),
            timeout: spec.timeout,
        };
        diagnose(&error.to_string(), &context, handle.pods.as_deref())
            .await
            .into()
    }

    /// Install a new release
    ///
    /// A failed release left under the same name is uninstalled first.
    pub async fn create(&self, spec: &ReleaseSpec) -> Result<TrackedRelease> {
        let values = Self::preflight(spec)?;
        let handle = self.connect(spec).await?;

        match handle.engine.get(&spec.name, &spec.namespace).await {
            Ok(existing) if existing.status == ReleaseStatus::Failed => {
                tracing::info!(release = %spec.name, namespace = %spec.namespace, "removing failed release before install");
                let request = UninstallRequest {
                    name: spec.name.clone(),
                    namespace: spec.namespace.clone(),
                    wait: WaitStrategy::HooksOnly,
                    disable_hooks: true,
                    timeout: spec.timeout,
                };
                handle.engine.uninstall(request).await?;
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let id = generate_release_id();
        let chart = self.resolve(spec).await?;

        let request = InstallRequest {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            chart,
            values,
            create_namespace: spec.create_namespace,
            wait: WaitStrategy::from_wait_flag(spec.wait),
            wait_for_jobs: spec.wait_for_jobs,
            atomic: spec.atomic,
            skip_validation: spec.skip_validation,
            disable_hooks: spec.disable_hooks,
            description: spec.description.clone(),
            timeout: spec.timeout,
            apply: ApplyPolicy::FORCED,
        };

        tracing::info!(release = %spec.name, namespace = %spec.namespace, "installing");
        match handle.engine.install(request).await {
            Ok(release) => {
                tracing::info!(release = %spec.name, revision = release.revision, status = %release.status, "installed");
                Ok(TrackedRelease {
                    spec: spec.clone(),
                    state: release.to_state(id),
                })
            }
            Err(e) => Err(self.enrich(e, Operation::Install, spec, &handle).await),
        }
    }

    /// Fetch the live release and report drift
    pub async fn read(&self, tracked: &TrackedRelease) -> Result<ReadOutcome> {
        let spec = &tracked.spec;
        let live = match self.connect(spec).await {
            Ok(handle) => handle.engine.get(&spec.name, &spec.namespace).await,
            Err(e) => Err(e),
        };

        match live {
            Ok(live) => {
                let drift = detect_drift(tracked, &live);
                for d in &drift {
                    tracing::warn!(release = %spec.name, kind = %d.kind, "{}", d.message);
                }
                let mut release = tracked.clone();
                live.apply_to(&mut release.state);
                Ok(ReadOutcome::Present {
                    release,
                    drift,
                    warnings: Vec::new(),
                })
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(release = %spec.name, namespace = %spec.namespace, "release no longer exists");
                Ok(ReadOutcome::Gone)
            }
            Err(e) if e.is_auth_error() => {
                let warning = format!(
                    "could not read release {} in namespace {} ({}); keeping the last known state",
                    spec.name, spec.namespace, e
                );
                tracing::warn!("{}", warning);
                Ok(ReadOutcome::Present {
                    release: tracked.clone(),
                    drift: Vec::new(),
                    warnings: vec![warning],
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Upgrade a tracked release to a new spec
    pub async fn update(&self, spec: &ReleaseSpec, prior: &TrackedRelease) -> Result<TrackedRelease> {
        if let Some(field) = spec.requires_replacement(&prior.spec) {
            let (from, to) = match field {
                "name" => (prior.spec.name.clone(), spec.name.clone()),
                _ => (prior.spec.namespace.clone(), spec.namespace.clone()),
            };
            return Err(KubeError::ImmutableField {
                field: field.to_string(),
                from,
                to,
            });
        }

        let values = Self::preflight(spec)?;
        let handle = self.connect(spec).await?;
        let cleanup_on_fail = match handle.engine.get(&spec.name, &spec.namespace).await {
            Ok(live) if live.status == ReleaseStatus::Failed => {
                tracing::info!(release = %spec.name, "live release is failed; cleaning up on failure");
                true
            }
            Ok(_) => spec.cleanup_on_fail,
            Err(e) => return Err(e),
        };

        let chart = self.resolve(spec).await?;

        let request = UpgradeRequest {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            chart,
            values,
            wait: WaitStrategy::from_wait_flag(spec.wait),
            wait_for_jobs: spec.wait_for_jobs,
            atomic: spec.atomic,
            skip_validation: spec.skip_validation,
            disable_hooks: spec.disable_hooks,
            cleanup_on_fail,
            reuse_values: spec.reuse_values,
            reset_values: spec.reset_values,
            max_history: spec.max_history,
            description: spec.description.clone(),
            timeout: spec.timeout,
            apply: ApplyPolicy::FORCED,
        };

        tracing::info!(release = %spec.name, namespace = %spec.namespace, "upgrading");
        match handle.engine.upgrade(request).await {
            Ok(release) => {
                tracing::info!(release = %spec.name, revision = release.revision, "upgraded");
                Ok(TrackedRelease {
                    spec: spec.clone(),
                    state: release.to_state(prior.state.id.clone()),
                })
            }
            Err(e) => Err(self.enrich(e, Operation::Upgrade, spec, &handle).await),
        }
    }

    /// Uninstall a tracked release; a release already gone is not an error
    pub async fn delete(&self, tracked: &TrackedRelease) -> Result<()> {
        let spec = &tracked.spec;
        let handle = self.connect(spec).await?;
        let request = UninstallRequest {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            wait: WaitStrategy::HooksOnly,
            disable_hooks: spec.disable_hooks,
            timeout: spec.timeout,
        };

        tracing::info!(release = %spec.name, namespace = %spec.namespace, "uninstalling");
        match handle.engine.uninstall(request).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::info!(release = %spec.name, "release already gone");
                Ok(())
            }
            Err(e) => Err(self.enrich(e, Operation::Uninstall, spec, &handle).await),
        }
    }

    /// Adopt a release that exists on the cluster
    pub async fn import(&self, id: &str) -> Result<Imported> {
        let id: ImportId = id.parse()?;
        let mut spec = ReleaseSpec::new(&id.name, &id.namespace, "");
        spec.kube_context = Some(id.context.clone());

        let handle = self.connect(&spec).await?;
        let live = handle.engine.get(&id.name, &id.namespace).await?;

        spec.chart = live.chart_name.clone();
        spec.version = Some(live.chart_version.clone());
        spec.description = live.description.clone();

        let warning = format!(
            "release {} imported without its chart repository or override values; \
             they cannot be recovered from the cluster and must be set before the next apply",
            id.name
        );
        tracing::warn!("{}", warning);

        Ok(Imported {
            release: TrackedRelease {
                state: live.to_state(id.to_string()),
                spec,
            },
            warnings: vec![warning],
        })
    }
}

/// Resolution settings carried by a spec
pub fn resolve_options(spec: &ReleaseSpec) -> ResolveOptions {
    let basic_auth = spec.repository_username.as_ref().map(|username| {
        let password = spec
            .repository_password
            .as_ref()
            .map(|p| p.expose().clone())
            .unwrap_or_default();
        BasicAuth::new(username.clone(), password)
    });

    ResolveOptions {
        version: spec.version.clone(),
        repository: spec.repository.clone(),
        basic_auth,
        tls: TlsSettings {
            cert_file: spec.repository_cert_file.as_ref().map(PathBuf::from),
            key_file: spec.repository_key_file.as_ref().map(PathBuf::from),
            ca_file: spec.repository_ca_file.as_ref().map(PathBuf::from),
            insecure_skip_verify: spec.insecure_skip_tls_verify,
        },
        registry_config: spec.registry_config_file.as_ref().map(PathBuf::from),
        pass_credentials: spec.pass_credentials,
        dependency_update: spec.dependency_update,
    }
}
