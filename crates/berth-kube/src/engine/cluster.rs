//! Release engine backed by a live cluster

use async_trait::async_trait;
use berth_core::ReleaseStatus;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::apply::{ManifestApplier, ManifestDocument, ParsedManifest};
use super::store::ReleaseStore;
use super::wait::ReadinessWaiter;
use super::{
    ApplyPolicy, EngineRelease, InstallRequest, ReleaseEngine, UninstallRequest, UpgradeRequest,
    WAIT_TIMEOUT_MESSAGE, WaitStrategy, upgrade_values,
};
use crate::bridge::ClientGetter;
use crate::error::{KubeError, Result};
use crate::render::{ReleaseContext, render_chart};

/// Hook phases around the main apply
struct Phases {
    pre: &'static str,
    post: &'static str,
}

const INSTALL: Phases = Phases {
    pre: "pre-install",
    post: "post-install",
};
const UPGRADE: Phases = Phases {
    pre: "pre-upgrade",
    post: "post-upgrade",
};
const DELETE: Phases = Phases {
    pre: "pre-delete",
    post: "post-delete",
};
const ROLLBACK: Phases = Phases {
    pre: "pre-rollback",
    post: "post-rollback",
};

/// Settings shared by every deploy step of one operation
struct DeployPlan<'a> {
    namespace: &'a str,
    wait: WaitStrategy,
    wait_for_jobs: bool,
    disable_hooks: bool,
    apply: ApplyPolicy,
}

pub struct KubeEngine {
    getter: Arc<dyn ClientGetter>,
    store: ReleaseStore,
    applier: ManifestApplier,
    waiter: ReadinessWaiter,
}

impl KubeEngine {
    pub fn new(getter: Arc<dyn ClientGetter>) -> Self {
        let client = getter.client();
        Self {
            store: ReleaseStore::new(client.clone()),
            applier: ManifestApplier::new(Arc::clone(&getter)),
            waiter: ReadinessWaiter::new(client),
            getter,
        }
    }

    pub fn store(&self) -> &ReleaseStore {
        &self.store
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.getter.client());
        if api.get_opt(namespace).await?.is_some() {
            return Ok(());
        }
        let object = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &object).await {
            Ok(_) => {
                tracing::info!(%namespace, "created namespace");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Recreate and run the hooks of one phase
    async fn run_hooks(&self, plan: &DeployPlan<'_>, manifest: &ParsedManifest, phase: &str) -> Result<()> {
        if plan.disable_hooks {
            return Ok(());
        }
        let hooks = manifest.hooks_for(phase);
        if hooks.is_empty() {
            return Ok(());
        }
        tracing::info!(%phase, count = hooks.len(), "running hooks");

        self.applier.delete(plan.namespace, &hooks).await?;
        self.waiter.wait_deleted(plan.namespace, &self.applier, &hooks).await?;
        self.applier.apply(plan.namespace, &hooks, plan.apply, false).await?;
        self.waiter.wait_jobs(plan.namespace, &hooks).await
    }

    /// Hooks, apply, readiness wait
    async fn deploy(&self, plan: &DeployPlan<'_>, manifest: &ParsedManifest, phases: &Phases) -> Result<()> {
        self.run_hooks(plan, manifest, phases.pre).await?;
        self.applier
            .apply(plan.namespace, &manifest.resources, plan.apply, false)
            .await?;
        if plan.wait == WaitStrategy::Ready {
            self.waiter
                .wait_ready(plan.namespace, &manifest.resources, plan.wait_for_jobs)
                .await?;
        }
        self.run_hooks(plan, manifest, phases.post).await
    }

    async fn validate(&self, namespace: &str, manifest: &ParsedManifest, policy: ApplyPolicy) -> Result<()> {
        self.applier.apply(namespace, &manifest.resources, policy, true).await
    }

    async fn mark(&self, release: &mut EngineRelease, status: ReleaseStatus, description: String) -> Result<()> {
        release.status = status;
        release.description = Some(description);
        self.store.update(release).await
    }

    /// Put the previous revision back after a failed upgrade
    async fn roll_back(
        &self,
        plan: &DeployPlan<'_>,
        failed: &mut EngineRelease,
        previous: &EngineRelease,
        timeout: Duration,
    ) -> Result<EngineRelease> {
        let mut restored = failed.next_revision_from(previous);
        restored.status = ReleaseStatus::PendingRollback;
        restored.description = Some(format!("Rollback to {}", previous.revision));
        self.store.create(&restored).await?;
        self.mark(failed, ReleaseStatus::Superseded, format!("Superseded by rollback to {}", previous.revision))
            .await?;

        let manifest = ParsedManifest::parse(&previous.manifest)?;
        with_timeout(timeout, self.deploy(plan, &manifest, &ROLLBACK)).await?;

        restored.status = ReleaseStatus::Deployed;
        self.store.update(&restored).await?;
        Ok(restored)
    }

    async fn delete_added(&self, namespace: &str, added: &[ManifestDocument]) {
        if added.is_empty() {
            return;
        }
        tracing::info!(count = added.len(), "deleting resources created by the failed upgrade");
        if let Err(e) = self.applier.delete(namespace, added).await {
            tracing::warn!(error = %e, "cleanup after failed upgrade did not complete");
        }
    }
}

#[async_trait]
impl ReleaseEngine for KubeEngine {
    async fn get(&self, name: &str, namespace: &str) -> Result<EngineRelease> {
        self.store.latest(name, namespace).await
    }

    async fn install(&self, request: InstallRequest) -> Result<EngineRelease> {
        let InstallRequest {
            name,
            namespace,
            chart,
            values,
            ..
        } = &request;

        if request.create_namespace {
            self.ensure_namespace(namespace).await?;
        }

        match self.store.latest(name, namespace).await {
            Ok(existing) if existing.status == ReleaseStatus::Uninstalled => {
                self.store.delete_all(name, namespace).await?;
            }
            Ok(_) => {
                return Err(KubeError::Operation {
                    title: format!("cannot install release {}", name),
                    detail: "cannot re-use a name that is still in use".to_string(),
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let rendered = render_chart(chart, values, &ReleaseContext::new(name, namespace, 1))?;
        let manifest = ParsedManifest::parse(&rendered.manifest)?;
        if !request.skip_validation {
            self.validate(namespace, &manifest, request.apply).await?;
        }

        let mut release = EngineRelease::pending_install(name, namespace, chart, values.clone());
        release.manifest = rendered.manifest;
        release.notes = rendered.notes;
        release.description = Some("Initial install underway".to_string());
        self.store.create(&release).await?;

        let plan = DeployPlan {
            namespace,
            wait: request.wait,
            wait_for_jobs: request.wait_for_jobs,
            disable_hooks: request.disable_hooks,
            apply: request.apply,
        };

        match with_timeout(request.timeout, self.deploy(&plan, &manifest, &INSTALL)).await {
            Ok(()) => {
                let description = request
                    .description
                    .clone()
                    .unwrap_or_else(|| "Install complete".to_string());
                self.mark(&mut release, ReleaseStatus::Deployed, description).await?;
                Ok(release)
            }
            Err(err) => {
                tracing::warn!(release = %name, error = %err, "install failed");
                self.mark(&mut release, ReleaseStatus::Failed, format!("Release \"{}\" failed: {}", name, err))
                    .await?;

                if !request.atomic {
                    return Err(err);
                }
                let uninstall = UninstallRequest {
                    name: name.clone(),
                    namespace: namespace.clone(),
                    wait: request.wait,
                    disable_hooks: request.disable_hooks,
                    timeout: request.timeout,
                };
                if let Err(cleanup) = self.uninstall(uninstall).await {
                    return Err(KubeError::Operation {
                        title: format!("release {} failed, and uninstalling it also failed", name),
                        detail: format!("{}; uninstall error: {}", err, cleanup),
                    });
                }
                Err(KubeError::Operation {
                    title: format!(
                        "release {} failed, and has been uninstalled due to atomic being set",
                        name
                    ),
                    detail: err.to_string(),
                })
            }
        }
    }

    async fn upgrade(&self, request: UpgradeRequest) -> Result<EngineRelease> {
        let UpgradeRequest {
            name,
            namespace,
            chart,
            ..
        } = &request;

        let mut previous = self.store.latest(name, namespace).await?;
        if previous.status.is_pending() {
            return Err(KubeError::Operation {
                title: format!("cannot upgrade release {}", name),
                detail: format!("another operation ({}) is in progress", previous.status),
            });
        }

        let values = upgrade_values(&previous.config, &request.values, request.reuse_values, request.reset_values);
        let context = ReleaseContext::new(name, namespace, previous.revision + 1);
        let rendered = render_chart(chart, &values, &context)?;
        let manifest = ParsedManifest::parse(&rendered.manifest)?;
        let previous_manifest = ParsedManifest::parse(&previous.manifest)?;
        if !request.skip_validation {
            self.validate(namespace, &manifest, request.apply).await?;
        }

        let mut release = previous.next_revision(chart, values, ReleaseStatus::PendingUpgrade);
        release.manifest = rendered.manifest;
        release.notes = rendered.notes;
        release.description = Some("Preparing upgrade".to_string());
        self.store.create(&release).await?;
        let superseded = previous.status != ReleaseStatus::Failed;
        if superseded {
            self.mark(&mut previous, ReleaseStatus::Superseded, "Superseded".to_string())
                .await?;
        }

        let plan = DeployPlan {
            namespace,
            wait: request.wait,
            wait_for_jobs: request.wait_for_jobs,
            disable_hooks: request.disable_hooks,
            apply: request.apply,
        };

        let outcome = match with_timeout(request.timeout, self.deploy(&plan, &manifest, &UPGRADE)).await {
            Ok(()) => {
                let removed = manifest.removed_since(&previous_manifest);
                if let Err(e) = self.applier.delete(namespace, &removed).await {
                    tracing::warn!(error = %e, "could not delete resources dropped by the upgrade");
                }
                let description = request
                    .description
                    .clone()
                    .unwrap_or_else(|| "Upgrade complete".to_string());
                self.mark(&mut release, ReleaseStatus::Deployed, description).await?;
                Ok(release)
            }
            Err(err) => {
                tracing::warn!(release = %name, error = %err, "upgrade failed");
                self.mark(&mut release, ReleaseStatus::Failed, format!("Upgrade \"{}\" failed: {}", name, err))
                    .await?;

                if request.cleanup_on_fail || request.atomic {
                    self.delete_added(namespace, &manifest.added_since(&previous_manifest)).await;
                }

                if request.atomic && superseded {
                    match self.roll_back(&plan, &mut release, &previous, request.timeout).await {
                        Ok(_) => Err(KubeError::Operation {
                            title: format!(
                                "release {} failed, and has been rolled back due to atomic being set",
                                name
                            ),
                            detail: err.to_string(),
                        }),
                        Err(rollback) => Err(KubeError::Operation {
                            title: format!("release {} failed, and rollback also failed", name),
                            detail: format!("{}; rollback error: {}", err, rollback),
                        }),
                    }
                } else {
                    Err(err)
                }
            }
        };

        if outcome.is_ok()
            && let Err(e) = self.store.prune(name, namespace, request.max_history).await
        {
            tracing::warn!(release = %name, error = %e, "could not prune release history");
        }
        outcome
    }

    async fn uninstall(&self, request: UninstallRequest) -> Result<()> {
        let mut release = self.store.latest(&request.name, &request.namespace).await?;
        self.mark(&mut release, ReleaseStatus::Uninstalling, "Deletion in progress".to_string())
            .await?;

        let manifest = ParsedManifest::parse(&release.manifest)?;
        let plan = DeployPlan {
            namespace: &request.namespace,
            wait: request.wait,
            wait_for_jobs: false,
            disable_hooks: request.disable_hooks,
            apply: ApplyPolicy::FORCED,
        };

        let teardown = async {
            self.run_hooks(&plan, &manifest, DELETE.pre).await?;
            self.applier.delete(&request.namespace, &manifest.resources).await?;
            if request.wait == WaitStrategy::Ready {
                self.waiter
                    .wait_deleted(&request.namespace, &self.applier, &manifest.resources)
                    .await?;
            }
            self.run_hooks(&plan, &manifest, DELETE.post).await
        };

        if let Err(err) = with_timeout(request.timeout, teardown).await {
            self.mark(&mut release, ReleaseStatus::Failed, format!("Uninstallation failed: {}", err))
                .await?;
            return Err(err);
        }

        self.store.delete_all(&request.name, &request.namespace).await?;
        tracing::info!(release = %request.name, namespace = %request.namespace, "uninstalled");
        Ok(())
    }
}

impl EngineRelease {
    /// Revision following `self` that carries `source`'s content
    fn next_revision_from(&self, source: &EngineRelease) -> EngineRelease {
        EngineRelease {
            revision: self.revision + 1,
            last_deployed: chrono::Utc::now(),
            first_deployed: self.first_deployed,
            ..source.clone()
        }
    }
}

async fn with_timeout<F>(timeout: Duration, operation: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(KubeError::Timeout(WAIT_TIMEOUT_MESSAGE.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::Values;

    fn release(revision: u32) -> EngineRelease {
        let now = chrono::Utc::now();
        EngineRelease {
            name: "web".into(),
            namespace: "apps".into(),
            revision,
            status: ReleaseStatus::Deployed,
            chart_name: "web".into(),
            chart_version: format!("1.0.{}", revision),
            app_version: None,
            config: Values::new(),
            manifest: format!("rev{}", revision),
            notes: None,
            description: None,
            first_deployed: now,
            last_deployed: now,
        }
    }

    #[tokio::test]
    async fn test_with_timeout_reports_wait_message() {
        let err = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), WAIT_TIMEOUT_MESSAGE);
    }

    #[tokio::test]
    async fn test_with_timeout_passes_errors_through() {
        let err = with_timeout(Duration::from_secs(5), async { Err(KubeError::Internal("boom".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::Internal(_)));
    }

    #[test]
    fn test_rollback_revision_carries_previous_content() {
        let failed = release(3);
        let previous = release(2);
        let restored = failed.next_revision_from(&previous);
        assert_eq!(restored.revision, 4);
        assert_eq!(restored.manifest, "rev2");
        assert_eq!(restored.chart_version, "1.0.2");
    }
}
