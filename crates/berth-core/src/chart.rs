//! Chart definition and loading

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::archive;
use crate::error::{CoreError, Result};
use crate::values::Values;

/// Contents of `Chart.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart API version (`v1` or `v2`)
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Chart name (required)
    pub name: String,

    /// Chart version (required, SemVer)
    #[serde(with = "version_serde")]
    pub version: Version,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// `application` or `library`
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

fn default_api_version() -> String {
    "v2".to_string()
}

impl ChartMetadata {
    /// Read `Chart.yaml` from a chart directory without loading the rest
    pub fn from_dir<P: AsRef<Path>>(path: P) -> Result<Self> {
        let chart_yaml = path.as_ref().join("Chart.yaml");
        if !chart_yaml.exists() {
            return Err(CoreError::InvalidChart {
                message: format!("Chart.yaml not found in {}", path.as_ref().display()),
            });
        }
        Ok(serde_yaml::from_slice(&std::fs::read(chart_yaml)?)?)
    }

    pub fn is_library(&self) -> bool {
        self.chart_type.as_deref() == Some("library")
    }
}

/// Chart dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Dependency name
    pub name: String,

    /// Version constraint (semver)
    #[serde(default)]
    pub version: String,

    /// Repository URL (`https://`, `oci://` or `file://`)
    #[serde(default)]
    pub repository: String,

    /// Dot-separated path evaluated against the parent values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Alias name (overrides dependency name in values and templates)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Dependency {
    /// Get the effective name (alias if set, otherwise name)
    #[inline]
    pub fn effective_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Whether the dependency is enabled for the given parent values
    ///
    /// Without a condition the dependency is always enabled. A condition
    /// whose path is missing counts as enabled, like an unset toggle.
    pub fn is_enabled(&self, values: &Values) -> bool {
        let Some(condition) = &self.condition else {
            return true;
        };

        match values.get(condition) {
            None => true,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.is_empty() && s != "false",
            Some(_) => true,
        }
    }
}

/// A chart held in memory, ready for rendering
#[derive(Debug, Clone)]
pub struct LoadedChart {
    pub metadata: ChartMetadata,

    /// Default values from `values.yaml`
    pub values: Values,

    /// Every file of the chart except subcharts, keyed by relative path
    pub files: BTreeMap<String, Vec<u8>>,

    /// Subcharts found under `charts/`
    pub dependencies: Vec<LoadedChart>,

    /// Directory the chart was loaded from, if any
    pub root: Option<PathBuf>,
}

impl LoadedChart {
    /// Load a chart from a directory or a `.tgz` archive on disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(CoreError::ChartNotFound {
                path: path.display().to_string(),
            });
        }

        if path.is_dir() {
            Self::load_dir(path)
        } else {
            let bytes = std::fs::read(path)?;
            Self::from_archive(&bytes)
        }
    }

    /// Load a chart from a directory
    pub fn load_dir<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root = path.as_ref();
        if !root.join("Chart.yaml").exists() {
            return Err(CoreError::InvalidChart {
                message: format!("Chart.yaml not found in {}", root.display()),
            });
        }

        let mut files = BTreeMap::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(|e| CoreError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(relative, std::fs::read(entry.path())?);
        }

        let mut chart = Self::from_files(files)?;
        chart.root = Some(root.to_path_buf());
        Ok(chart)
    }

    /// Load a chart from `.tgz` bytes
    pub fn from_archive(bytes: &[u8]) -> Result<Self> {
        let files = archive::read_archive(bytes)?;
        Self::from_files(files)
    }

    /// Build a chart from a flat file map
    pub fn from_files(files: BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let chart_yaml = files.get("Chart.yaml").ok_or_else(|| CoreError::InvalidChart {
            message: "Chart.yaml is missing".to_string(),
        })?;
        let metadata: ChartMetadata = serde_yaml::from_slice(chart_yaml)?;

        if metadata.name.is_empty() {
            return Err(CoreError::MissingField {
                field: "name".to_string(),
            });
        }

        let values = match files.get("values.yaml") {
            Some(raw) => Values::from_yaml(&String::from_utf8_lossy(raw))?,
            None => Values::new(),
        };

        let mut own = BTreeMap::new();
        let mut subchart_dirs: BTreeMap<String, BTreeMap<String, Vec<u8>>> = BTreeMap::new();
        let mut dependencies = Vec::new();

        for (path, content) in files {
            let Some(rest) = path.strip_prefix("charts/") else {
                own.insert(path, content);
                continue;
            };

            match rest.split_once('/') {
                Some((dir, inner)) => {
                    subchart_dirs
                        .entry(dir.to_string())
                        .or_default()
                        .insert(inner.to_string(), content);
                }
                None if rest.ends_with(".tgz") || rest.ends_with(".tar.gz") => {
                    dependencies.push(Self::from_archive(&content)?);
                }
                None => {}
            }
        }

        for (_, sub_files) in subchart_dirs {
            if sub_files.contains_key("Chart.yaml") {
                dependencies.push(Self::from_files(sub_files)?);
            }
        }

        Ok(Self {
            metadata,
            values,
            files: own,
            dependencies,
            root: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Template sources, sorted by path, excluding partials (`_*.tpl`) and NOTES.txt
    pub fn templates(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().filter_map(|(path, content)| {
            let name = path.strip_prefix("templates/")?;
            let base = name.rsplit('/').next().unwrap_or(name);
            if base.starts_with('_') || base == "NOTES.txt" {
                return None;
            }
            Some((path.as_str(), content.as_slice()))
        })
    }

    /// Partial templates (`templates/_*.tpl`)
    pub fn partials(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().filter_map(|(path, content)| {
            let name = path.strip_prefix("templates/")?;
            let base = name.rsplit('/').next().unwrap_or(name);
            base.starts_with('_')
                .then_some((path.as_str(), content.as_slice()))
        })
    }

    /// `templates/NOTES.txt`, if present
    pub fn notes_template(&self) -> Option<&[u8]> {
        self.files.get("templates/NOTES.txt").map(Vec::as_slice)
    }

    /// Find the subchart backing a declared dependency
    pub fn subchart_for(&self, dependency: &Dependency) -> Option<&LoadedChart> {
        self.dependencies.iter().find(|c| c.name() == dependency.name)
    }

    /// Declared dependencies whose subchart is not present under `charts/`
    pub fn missing_dependencies(&self) -> Vec<&Dependency> {
        self.metadata
            .dependencies
            .iter()
            .filter(|d| self.subchart_for(d).is_none())
            .collect()
    }
}

/// Custom serde for semver::Version
mod version_serde {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(version: &Version, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&version.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Version, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Chart.yaml versions are often unquoted, so YAML may hand us a number
        let raw = serde_yaml::Value::deserialize(deserializer)?;
        let s = match raw {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a version string, found {:?}",
                    other
                )));
            }
        };
        Version::parse(s.trim_start_matches('v')).map_err(serde::de::Error::custom)
    }
}
