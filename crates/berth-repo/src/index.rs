//! Chart repository index (`index.yaml`)

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{RepoError, Result};

/// Repository index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryIndex {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default)]
    pub generated: Option<DateTime<Utc>>,

    /// Chart versions indexed by chart name
    #[serde(default)]
    pub entries: HashMap<String, Vec<ChartEntry>>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

impl RepositoryIndex {
    /// Parse index from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RepoError::IndexParseError {
            message: e.to_string(),
        })
    }

    /// Parse index from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let yaml = std::str::from_utf8(bytes).map_err(|e| RepoError::IndexParseError {
            message: format!("Invalid UTF-8: {}", e),
        })?;
        Self::from_yaml(yaml)
    }

    /// Locate a chart version
    ///
    /// No version (or an empty one) selects the latest stable release. A
    /// plain version string matches only that version; anything else is
    /// read as a semver range and the highest match wins.
    pub fn find_chart(&self, name: &str, version: Option<&str>, repo: &str) -> Result<&ChartEntry> {
        let entries = self
            .entries
            .get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RepoError::ChartNotFound {
                name: name.to_string(),
                repo: repo.to_string(),
            })?;

        let version = version.map(str::trim).filter(|v| !v.is_empty());

        let best = match version {
            None => entries
                .iter()
                .filter_map(|e| e.parsed_version().map(|v| (v, e)))
                .filter(|(v, _)| v.pre.is_empty())
                .max_by(|a, b| a.0.cmp(&b.0)),
            Some(raw) => {
                let exact = raw.trim_start_matches('v');
                if let Ok(wanted) = Version::parse(exact) {
                    entries
                        .iter()
                        .filter_map(|e| e.parsed_version().map(|v| (v, e)))
                        .find(|(v, _)| *v == wanted)
                } else {
                    let req = VersionReq::parse(raw).map_err(|e| RepoError::InvalidConstraint {
                        constraint: raw.to_string(),
                        reason: e.to_string(),
                    })?;
                    entries
                        .iter()
                        .filter_map(|e| e.parsed_version().map(|v| (v, e)))
                        .filter(|(v, _)| req.matches(v))
                        .max_by(|a, b| a.0.cmp(&b.0))
                }
            }
        };

        best.map(|(_, entry)| entry)
            .ok_or_else(|| RepoError::UnsatisfiableConstraint {
                name: name.to_string(),
                constraint: version.unwrap_or("latest").to_string(),
                available: entries
                    .iter()
                    .map(|e| e.version.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// One chart version in the index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartEntry {
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub app_version: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Download URLs, absolute, relative to the repository, or `oci://`
    #[serde(default)]
    pub urls: Vec<String>,

    /// SHA256 digest of the archive
    #[serde(default)]
    pub digest: Option<String>,

    #[serde(default)]
    pub created: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deprecated: bool,
}

impl ChartEntry {
    /// Get the primary download URL
    pub fn download_url(&self) -> Option<&str> {
        self.urls.first().map(|s| s.as_str())
    }

    /// Whether the entry redirects to an OCI registry
    pub fn is_oci(&self) -> bool {
        self.download_url()
            .is_some_and(|url| url.starts_with("oci://"))
    }

    /// Parse version as semver
    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse(self.version.trim_start_matches('v')).ok()
    }
}
