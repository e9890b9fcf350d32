//! Release engine: the install / upgrade / uninstall / get primitive
//!
//! The lifecycle only speaks to [`ReleaseEngine`]. [`KubeEngine`] implements
//! it against a cluster (release records in Secrets, server-side apply,
//! readiness wait); [`MockReleaseEngine`] keeps everything in memory.

mod apply;
mod cluster;
mod mock;
mod store;
mod wait;

pub use self::apply::{ManifestApplier, ManifestDocument, ParsedManifest, is_hook};
pub use self::cluster::KubeEngine;
pub use self::mock::{EngineCall, MockFailure, MockReleaseEngine};
pub use self::store::{ReleaseStore, decode_record, encode_record, record_key};
pub use self::wait::ReadinessWaiter;

use async_trait::async_trait;
use berth_core::{LoadedChart, ReleaseState, ReleaseStatus, Values};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Message the engine reports when a wait exceeds its timeout
pub const WAIT_TIMEOUT_MESSAGE: &str = "timed out waiting for the condition";

/// What an operation waits for before it reports success
///
/// Required on every request; there is no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Hooks, then every workload ready
    Ready,
    /// Only hooks run to completion
    HooksOnly,
}

impl WaitStrategy {
    pub fn from_wait_flag(wait: bool) -> Self {
        if wait { Self::Ready } else { Self::HooksOnly }
    }
}

/// Server-side apply settings shared by install and upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyPolicy {
    pub server_side: bool,
    pub force_conflicts: bool,
}

impl ApplyPolicy {
    /// Server-side apply, taking ownership of conflicting fields
    pub const FORCED: ApplyPolicy = ApplyPolicy {
        server_side: true,
        force_conflicts: true,
    };
}

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub name: String,
    pub namespace: String,
    pub chart: LoadedChart,
    pub values: Values,
    pub create_namespace: bool,
    pub wait: WaitStrategy,
    pub wait_for_jobs: bool,
    /// Uninstall everything on failure
    pub atomic: bool,
    /// Skip the server-side dry-run validation pass
    pub skip_validation: bool,
    pub disable_hooks: bool,
    pub description: Option<String>,
    pub timeout: Duration,
    pub apply: ApplyPolicy,
}

#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub name: String,
    pub namespace: String,
    pub chart: LoadedChart,
    pub values: Values,
    pub wait: WaitStrategy,
    pub wait_for_jobs: bool,
    /// Roll back to the previous revision on failure
    pub atomic: bool,
    pub skip_validation: bool,
    pub disable_hooks: bool,
    /// Delete resources created by a failed upgrade
    pub cleanup_on_fail: bool,
    pub reuse_values: bool,
    pub reset_values: bool,
    /// Revisions to keep; 0 keeps all
    pub max_history: u32,
    pub description: Option<String>,
    pub timeout: Duration,
    pub apply: ApplyPolicy,
}

#[derive(Debug, Clone)]
pub struct UninstallRequest {
    pub name: String,
    pub namespace: String,
    pub wait: WaitStrategy,
    pub disable_hooks: bool,
    pub timeout: Duration,
}

/// A release revision as recorded by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRelease {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub status: ReleaseStatus,
    pub chart_name: String,
    pub chart_version: String,
    #[serde(default)]
    pub app_version: Option<String>,
    /// User-supplied values of this revision
    #[serde(default)]
    pub config: Values,
    pub manifest: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub first_deployed: DateTime<Utc>,
    pub last_deployed: DateTime<Utc>,
}

impl EngineRelease {
    /// First revision of a release about to be installed
    pub fn pending_install(name: &str, namespace: &str, chart: &LoadedChart, config: Values) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision: 1,
            status: ReleaseStatus::PendingInstall,
            chart_name: chart.name().to_string(),
            chart_version: chart.metadata.version.to_string(),
            app_version: chart.metadata.app_version.clone(),
            config,
            manifest: String::new(),
            notes: None,
            description: None,
            first_deployed: now,
            last_deployed: now,
        }
    }

    /// Next revision on top of `self`
    pub fn next_revision(&self, chart: &LoadedChart, config: Values, status: ReleaseStatus) -> Self {
        Self {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            revision: self.revision + 1,
            status,
            chart_name: chart.name().to_string(),
            chart_version: chart.metadata.version.to_string(),
            app_version: chart.metadata.app_version.clone(),
            config,
            manifest: String::new(),
            notes: None,
            description: None,
            first_deployed: self.first_deployed,
            last_deployed: Utc::now(),
        }
    }

    /// Copy every computed field into tracked state
    pub fn apply_to(&self, state: &mut ReleaseState) {
        state.revision = self.revision;
        state.status = self.status;
        state.manifest = self.manifest.clone().into();
        state.chart_name = self.chart_name.clone();
        state.chart_version = self.chart_version.clone();
        state.app_version = self.app_version.clone();
        state.first_deployed = Some(self.first_deployed);
        state.last_deployed = Some(self.last_deployed);
        state.notes = self.notes.clone();
        state.metadata.insert("name".to_string(), self.name.clone());
        state.metadata.insert("namespace".to_string(), self.namespace.clone());
        state.metadata.insert("revision".to_string(), self.revision.to_string());
        match &self.description {
            Some(description) => {
                state.metadata.insert("description".to_string(), description.clone());
            }
            None => {
                state.metadata.remove("description");
            }
        }
    }

    /// Fresh tracked state with the given identifier
    pub fn to_state(&self, id: impl Into<String>) -> ReleaseState {
        let mut state = ReleaseState {
            id: id.into(),
            ..Default::default()
        };
        self.apply_to(&mut state);
        state
    }
}

/// The release primitive the lifecycle drives
#[async_trait]
pub trait ReleaseEngine: Send + Sync {
    /// Latest revision; `KubeError::ReleaseNotFound` when there is none
    async fn get(&self, name: &str, namespace: &str) -> Result<EngineRelease>;

    async fn install(&self, request: InstallRequest) -> Result<EngineRelease>;

    async fn upgrade(&self, request: UpgradeRequest) -> Result<EngineRelease>;

    async fn uninstall(&self, request: UninstallRequest) -> Result<()>;
}

/// Values for an upgrade, given the previous revision's values
pub fn upgrade_values(previous: &Values, requested: &Values, reuse: bool, reset: bool) -> Values {
    if reset || !reuse {
        requested.clone()
    } else {
        let mut merged = previous.clone();
        merged.merge(requested);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_strategy_from_flag() {
        assert_eq!(WaitStrategy::from_wait_flag(true), WaitStrategy::Ready);
        assert_eq!(WaitStrategy::from_wait_flag(false), WaitStrategy::HooksOnly);
    }

    #[test]
    fn test_upgrade_values() {
        let previous = Values::from_yaml("a: 1\nb: 1\n").unwrap();
        let requested = Values::from_yaml("b: 2\n").unwrap();

        let reused = upgrade_values(&previous, &requested, true, false);
        assert_eq!(reused.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(reused.get("b"), Some(&serde_json::json!(2)));

        let reset = upgrade_values(&previous, &requested, true, true);
        assert_eq!(reset.get("a"), None);

        let fresh = upgrade_values(&previous, &requested, false, false);
        assert_eq!(fresh, requested);
    }

    #[test]
    fn test_apply_to_state() {
        let chart = LoadedChart::from_files(
            [("Chart.yaml".to_string(), b"name: web\nversion: 1.2.0\nappVersion: '3.0'\n".to_vec())]
                .into_iter()
                .collect(),
        )
        .unwrap();
        let mut release = EngineRelease::pending_install("web", "apps", &chart, Values::new());
        release.status = ReleaseStatus::Deployed;
        release.manifest = "kind: ConfigMap".into();

        let state = release.to_state("abc");
        assert_eq!(state.id, "abc");
        assert_eq!(state.revision, 1);
        assert_eq!(state.status, ReleaseStatus::Deployed);
        assert_eq!(state.chart_version, "1.2.0");
        assert_eq!(state.app_version.as_deref(), Some("3.0"));
        assert_eq!(state.manifest.expose(), "kind: ConfigMap");
        assert_eq!(state.metadata.get("namespace").map(String::as_str), Some("apps"));
    }
}
