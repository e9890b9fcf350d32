//! In-memory release engine for tests
//!
//! Renders charts for real but never talks to a cluster. Failures can be
//! injected per operation, and every call is recorded for assertions.

use async_trait::async_trait;
use berth_core::ReleaseStatus;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{
    EngineRelease, InstallRequest, ReleaseEngine, UninstallRequest, UpgradeRequest, WAIT_TIMEOUT_MESSAGE,
    upgrade_values,
};
use crate::error::{KubeError, Result};
use crate::render::{ReleaseContext, render_chart};

/// A failure to return from the next call of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Arbitrary engine error text
    Message(String),
    /// The readiness wait ran out of time
    Timeout,
    /// 401 from the API server
    Auth,
    /// No such release
    NotFound,
}

impl MockFailure {
    fn into_error(self, name: &str, namespace: &str) -> KubeError {
        match self {
            MockFailure::Message(message) => KubeError::Operation {
                title: "engine failure".to_string(),
                detail: message,
            },
            MockFailure::Timeout => KubeError::Timeout(WAIT_TIMEOUT_MESSAGE.to_string()),
            MockFailure::Auth => KubeError::Api(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "Unauthorized".to_string(),
                reason: "Unauthorized".to_string(),
                code: 401,
            })),
            MockFailure::NotFound => KubeError::ReleaseNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
        }
    }
}

/// A recorded engine call
#[derive(Debug, Clone)]
pub enum EngineCall {
    Get { name: String, namespace: String },
    Install(InstallRequest),
    Upgrade(UpgradeRequest),
    Uninstall(UninstallRequest),
}

#[derive(Debug, Default)]
struct PlannedFailures {
    get: Option<MockFailure>,
    install: Option<MockFailure>,
    upgrade: Option<MockFailure>,
    uninstall: Option<MockFailure>,
}

type History = HashMap<(String, String), Vec<EngineRelease>>;

#[derive(Clone, Default)]
pub struct MockReleaseEngine {
    /// (namespace, name) -> revisions, oldest first
    releases: Arc<RwLock<History>>,
    failures: Arc<RwLock<PlannedFailures>>,
    calls: Arc<RwLock<Vec<EngineCall>>>,
}

impl MockReleaseEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with a release revision
    pub fn with_release(self, release: EngineRelease) -> Self {
        self.seed(release);
        self
    }

    pub fn seed(&self, release: EngineRelease) {
        let mut releases = self.releases.write().unwrap();
        let history = releases
            .entry((release.namespace.clone(), release.name.clone()))
            .or_default();
        history.push(release);
        history.sort_by_key(|r| r.revision);
    }

    /// Change the latest revision's status, as an out-of-band actor would
    pub fn set_status(&self, name: &str, namespace: &str, status: ReleaseStatus) {
        let mut releases = self.releases.write().unwrap();
        if let Some(latest) = releases
            .get_mut(&(namespace.to_string(), name.to_string()))
            .and_then(|h| h.last_mut())
        {
            latest.status = status;
        }
    }

    /// Delete every revision, as `helm uninstall` run by hand would
    pub fn remove(&self, name: &str, namespace: &str) {
        self.releases
            .write()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn history(&self, name: &str, namespace: &str) -> Vec<EngineRelease> {
        self.releases
            .read()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn fail_next_get(&self, failure: MockFailure) {
        self.failures.write().unwrap().get = Some(failure);
    }

    pub fn fail_next_install(&self, failure: MockFailure) {
        self.failures.write().unwrap().install = Some(failure);
    }

    pub fn fail_next_upgrade(&self, failure: MockFailure) {
        self.failures.write().unwrap().upgrade = Some(failure);
    }

    pub fn fail_next_uninstall(&self, failure: MockFailure) {
        self.failures.write().unwrap().uninstall = Some(failure);
    }

    fn record(&self, call: EngineCall) {
        self.calls.write().unwrap().push(call);
    }

    fn latest(&self, name: &str, namespace: &str) -> Option<EngineRelease> {
        self.history(name, namespace).last().cloned()
    }

    fn not_found(name: &str, namespace: &str) -> KubeError {
        KubeError::ReleaseNotFound {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl ReleaseEngine for MockReleaseEngine {
    async fn get(&self, name: &str, namespace: &str) -> Result<EngineRelease> {
        self.record(EngineCall::Get {
            name: name.to_string(),
            namespace: namespace.to_string(),
        });
        if let Some(failure) = self.failures.write().unwrap().get.take() {
            return Err(failure.into_error(name, namespace));
        }
        self.latest(name, namespace)
            .ok_or_else(|| Self::not_found(name, namespace))
    }

    async fn install(&self, request: InstallRequest) -> Result<EngineRelease> {
        self.record(EngineCall::Install(request.clone()));
        let (name, namespace) = (request.name.as_str(), request.namespace.as_str());

        if let Some(existing) = self.latest(name, namespace)
            && existing.status != ReleaseStatus::Uninstalled
        {
            return Err(KubeError::Operation {
                title: format!("cannot install release {}", name),
                detail: "cannot re-use a name that is still in use".to_string(),
            });
        }
        self.remove(name, namespace);

        let rendered = render_chart(&request.chart, &request.values, &ReleaseContext::new(name, namespace, 1))?;
        let mut release = EngineRelease::pending_install(name, namespace, &request.chart, request.values.clone());
        release.manifest = rendered.manifest;
        release.notes = rendered.notes;

        let failure = self.failures.write().unwrap().install.take();
        if let Some(failure) = failure {
            let err = failure.into_error(name, namespace);
            if request.atomic {
                return Err(KubeError::Operation {
                    title: format!(
                        "release {} failed, and has been uninstalled due to atomic being set",
                        name
                    ),
                    detail: err.to_string(),
                });
            }
            release.status = ReleaseStatus::Failed;
            release.description = Some(format!("Release \"{}\" failed: {}", name, err));
            self.seed(release);
            return Err(err);
        }

        release.status = ReleaseStatus::Deployed;
        release.description = Some(
            request
                .description
                .clone()
                .unwrap_or_else(|| "Install complete".to_string()),
        );
        self.seed(release.clone());
        Ok(release)
    }

    async fn upgrade(&self, request: UpgradeRequest) -> Result<EngineRelease> {
        self.record(EngineCall::Upgrade(request.clone()));
        let (name, namespace) = (request.name.as_str(), request.namespace.as_str());

        let previous = self
            .latest(name, namespace)
            .ok_or_else(|| Self::not_found(name, namespace))?;
        let values = upgrade_values(&previous.config, &request.values, request.reuse_values, request.reset_values);
        let rendered = render_chart(
            &request.chart,
            &values,
            &ReleaseContext::new(name, namespace, previous.revision + 1),
        )?;
        let mut release = previous.next_revision(&request.chart, values, ReleaseStatus::PendingUpgrade);
        release.manifest = rendered.manifest;
        release.notes = rendered.notes;

        let previous_failed = previous.status == ReleaseStatus::Failed;
        if !previous_failed {
            self.set_status(name, namespace, ReleaseStatus::Superseded);
        }

        let failure = self.failures.write().unwrap().upgrade.take();
        if let Some(failure) = failure {
            let err = failure.into_error(name, namespace);
            release.status = ReleaseStatus::Failed;
            release.description = Some(format!("Upgrade \"{}\" failed: {}", name, err));
            let failed_revision = release.revision;
            self.seed(release);

            if request.atomic && !previous_failed {
                let mut restored = previous.clone();
                restored.revision = failed_revision + 1;
                restored.status = ReleaseStatus::Deployed;
                restored.description = Some(format!("Rollback to {}", previous.revision));
                self.set_status(name, namespace, ReleaseStatus::Superseded);
                self.seed(restored);
                return Err(KubeError::Operation {
                    title: format!(
                        "release {} failed, and has been rolled back due to atomic being set",
                        name
                    ),
                    detail: err.to_string(),
                });
            }
            return Err(err);
        }

        release.status = ReleaseStatus::Deployed;
        release.description = Some(
            request
                .description
                .clone()
                .unwrap_or_else(|| "Upgrade complete".to_string()),
        );
        self.seed(release.clone());

        if request.max_history > 0 {
            let mut releases = self.releases.write().unwrap();
            if let Some(history) = releases.get_mut(&(namespace.to_string(), name.to_string())) {
                let excess = history.len().saturating_sub(request.max_history as usize);
                history.drain(..excess);
            }
        }
        Ok(release)
    }

    async fn uninstall(&self, request: UninstallRequest) -> Result<()> {
        self.record(EngineCall::Uninstall(request.clone()));
        let (name, namespace) = (request.name.as_str(), request.namespace.as_str());

        if let Some(failure) = self.failures.write().unwrap().uninstall.take() {
            return Err(failure.into_error(name, namespace));
        }
        if self.latest(name, namespace).is_none() {
            return Err(Self::not_found(name, namespace));
        }
        self.remove(name, namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ApplyPolicy, WaitStrategy};
    use berth_core::{LoadedChart, Values};
    use std::time::Duration;

    fn chart(version: &str) -> LoadedChart {
        LoadedChart::from_files(
            [
                (
                    "Chart.yaml".to_string(),
                    format!("name: web\nversion: {}\n", version).into_bytes(),
                ),
                (
                    "templates/cm.yaml".to_string(),
                    b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ release.name }}\n".to_vec(),
                ),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap()
    }

    fn install(name: &str, atomic: bool) -> InstallRequest {
        InstallRequest {
            name: name.into(),
            namespace: "default".into(),
            chart: chart("1.0.0"),
            values: Values::new(),
            create_namespace: false,
            wait: WaitStrategy::Ready,
            wait_for_jobs: false,
            atomic,
            skip_validation: false,
            disable_hooks: false,
            description: None,
            timeout: Duration::from_secs(300),
            apply: ApplyPolicy::FORCED,
        }
    }

    fn upgrade(name: &str, version: &str, max_history: u32) -> UpgradeRequest {
        UpgradeRequest {
            name: name.into(),
            namespace: "default".into(),
            chart: chart(version),
            values: Values::new(),
            wait: WaitStrategy::Ready,
            wait_for_jobs: false,
            atomic: false,
            skip_validation: false,
            disable_hooks: false,
            cleanup_on_fail: false,
            reuse_values: false,
            reset_values: false,
            max_history,
            description: None,
            timeout: Duration::from_secs(300),
            apply: ApplyPolicy::FORCED,
        }
    }

    #[tokio::test]
    async fn test_install_renders_and_records() {
        let engine = MockReleaseEngine::new();
        let release = engine.install(install("web", false)).await.unwrap();

        assert_eq!(release.revision, 1);
        assert_eq!(release.status, ReleaseStatus::Deployed);
        assert!(release.manifest.contains("name: web"));
        assert_eq!(engine.get("web", "default").await.unwrap(), release);
        assert!(matches!(engine.calls()[0], EngineCall::Install(_)));
    }

    #[tokio::test]
    async fn test_install_rejects_name_in_use() {
        let engine = MockReleaseEngine::new();
        engine.install(install("web", false)).await.unwrap();
        let err = engine.install(install("web", false)).await.unwrap_err();
        assert!(err.to_string().contains("still in use"));
    }

    #[tokio::test]
    async fn test_failed_install_leaves_failed_record() {
        let engine = MockReleaseEngine::new();
        engine.fail_next_install(MockFailure::Timeout);

        let err = engine.install(install("web", false)).await.unwrap_err();
        assert_eq!(err.to_string(), WAIT_TIMEOUT_MESSAGE);
        assert_eq!(engine.get("web", "default").await.unwrap().status, ReleaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_atomic_install_removes_release() {
        let engine = MockReleaseEngine::new();
        engine.fail_next_install(MockFailure::Timeout);

        let err = engine.install(install("web", true)).await.unwrap_err();
        assert!(err.to_string().contains("uninstalled due to atomic being set"));
        assert!(engine.get("web", "default").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_upgrade_supersedes_and_prunes() {
        let engine = MockReleaseEngine::new();
        engine.install(install("web", false)).await.unwrap();
        engine.upgrade(upgrade("web", "1.1.0", 0)).await.unwrap();
        let latest = engine.upgrade(upgrade("web", "1.2.0", 2)).await.unwrap();

        assert_eq!(latest.revision, 3);
        assert_eq!(latest.chart_version, "1.2.0");
        let history = engine.history("web", "default");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ReleaseStatus::Superseded);
    }

    #[tokio::test]
    async fn test_upgrade_missing_release() {
        let engine = MockReleaseEngine::new();
        let err = engine.upgrade(upgrade("web", "1.1.0", 0)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_auth_failure() {
        let engine = MockReleaseEngine::new();
        engine.fail_next_get(MockFailure::Auth);
        let err = engine.get("web", "default").await.unwrap_err();
        assert!(err.is_auth_error());
        // only the next call fails
        assert!(engine.get("web", "default").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_uninstall() {
        let engine = MockReleaseEngine::new();
        engine.install(install("web", false)).await.unwrap();
        let request = UninstallRequest {
            name: "web".into(),
            namespace: "default".into(),
            wait: WaitStrategy::HooksOnly,
            disable_hooks: false,
            timeout: Duration::from_secs(60),
        };
        engine.uninstall(request.clone()).await.unwrap();
        assert!(engine.uninstall(request).await.unwrap_err().is_not_found());
    }
}
