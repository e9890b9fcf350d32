//! Release management types: desired spec, observed state, tracked record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::sensitive::Sensitive;
use crate::values::{SetListValue, SetSensitiveValue, SetValue, Values, ValuesMerger};

/// Desired state of a release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    /// Release name (immutable)
    pub name: String,

    /// Target namespace (immutable)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Kubeconfig context used to reach the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_context: Option<String>,

    /// Chart path, chart name, or full `oci://` reference
    pub chart: String,

    /// Repository URL for remote charts (`https://` or `oci://`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Version or version constraint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_password: Option<Sensitive<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_cert_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_key_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_ca_file: Option<String>,

    /// Registry credential file (docker `config.json` format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_config_file: Option<String>,

    /// Send repository credentials to every host, not only the repository's
    #[serde(default)]
    pub pass_credentials: bool,

    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Raw YAML values document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<SetValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_list: Vec<SetListValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_sensitive: Vec<SetSensitiveValue>,

    #[serde(default)]
    pub create_namespace: bool,

    /// Skip server-side validation of rendered manifests
    #[serde(default)]
    pub skip_validation: bool,

    /// Do not run lifecycle hooks
    #[serde(default)]
    pub disable_hooks: bool,

    /// Wait for workloads to become ready
    #[serde(default = "default_true")]
    pub wait: bool,

    /// Also wait for Jobs to complete
    #[serde(default)]
    pub wait_for_jobs: bool,

    /// Roll back (or uninstall on first install) when the operation fails
    #[serde(default)]
    pub atomic: bool,

    /// Refresh chart dependencies before loading
    #[serde(default)]
    pub dependency_update: bool,

    /// Reuse the previous release's values on upgrade
    #[serde(default)]
    pub reuse_values: bool,

    /// Ignore the previous release's values on upgrade
    #[serde(default)]
    pub reset_values: bool,

    /// Delete resources created by a failed upgrade
    #[serde(default)]
    pub cleanup_on_fail: bool,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Revisions to keep, 0 for unlimited
    #[serde(default)]
    pub max_history: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

impl ReleaseSpec {
    /// Minimal spec for a chart; everything else defaulted
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, chart: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            kube_context: None,
            chart: chart.into(),
            repository: None,
            version: None,
            repository_username: None,
            repository_password: None,
            repository_cert_file: None,
            repository_key_file: None,
            repository_ca_file: None,
            registry_config_file: None,
            pass_credentials: false,
            insecure_skip_tls_verify: false,
            values: None,
            set: Vec::new(),
            set_list: Vec::new(),
            set_sensitive: Vec::new(),
            create_namespace: false,
            skip_validation: false,
            disable_hooks: false,
            wait: true,
            wait_for_jobs: false,
            atomic: false,
            dependency_update: false,
            reuse_values: false,
            reset_values: false,
            cleanup_on_fail: false,
            timeout: default_timeout(),
            max_history: 0,
            description: None,
        }
    }

    /// Parse a spec from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Merge every override source of this spec
    pub fn merged_values(&self) -> Result<Values> {
        ValuesMerger::new()
            .with_document(self.values.as_deref())
            .with_set(&self.set)
            .with_set_list(&self.set_list)
            .with_set_sensitive(&self.set_sensitive)
            .merge()
    }

    /// Name of the first immutable field that differs from `prior`
    pub fn requires_replacement(&self, prior: &ReleaseSpec) -> Option<&'static str> {
        if self.name != prior.name {
            Some("name")
        } else if self.namespace != prior.namespace {
            Some("namespace")
        } else {
            None
        }
    }
}

/// Observed state of a release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseState {
    /// Opaque identifier of the tracked resource
    pub id: String,

    pub revision: u32,

    pub status: ReleaseStatus,

    /// Rendered manifest; may contain secrets from merged values
    #[serde(default)]
    pub manifest: Sensitive<String>,

    /// Chart name reported by the cluster
    pub chart_name: String,

    /// Chart version reported by the cluster
    pub chart_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_deployed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A release as persisted by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRelease {
    pub spec: ReleaseSpec,
    pub state: ReleaseState,
}

/// Release status
///
/// Note: This enum is non-exhaustive - new variants may be added in future versions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ReleaseStatus {
    #[default]
    Unknown,
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    /// Statuses that warrant operator attention when observed on the cluster
    pub fn is_problematic(&self) -> bool {
        matches!(self, Self::Failed | Self::Superseded | Self::Uninstalling)
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback
        )
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Deployed => "deployed",
            Self::Uninstalled => "uninstalled",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
            Self::Uninstalling => "uninstalling",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
        };
        write!(f, "{}", s)
    }
}

/// Generate a random opaque identifier (32 hex chars)
pub fn generate_release_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
