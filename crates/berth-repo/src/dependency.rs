//! Dependency refresh: fetch declared dependencies into `charts/`

use berth_core::{Dependency, LoadedChart, archive};
use std::path::{Path, PathBuf};

use crate::error::{RepoError, Result};
use crate::http::HttpRepository;
use crate::oci::OciReference;
use crate::resolver::ChartResolver;

/// Writes `charts/<name>-<version>.tgz` for each declared dependency
pub struct DependencyManager<'a> {
    resolver: &'a ChartResolver,
}

impl<'a> DependencyManager<'a> {
    pub fn new(resolver: &'a ChartResolver) -> Self {
        Self { resolver }
    }

    /// Fetch every dependency and return the archives written
    ///
    /// Dependencies without a repository are expected to be vendored
    /// already and are left alone.
    pub async fn update(&self, chart_dir: &Path, dependencies: &[Dependency]) -> Result<Vec<PathBuf>> {
        let charts_dir = chart_dir.join("charts");
        std::fs::create_dir_all(&charts_dir)?;

        let mut written = Vec::new();
        for dep in dependencies {
            let repository = dep.repository.trim();
            if repository.is_empty() {
                tracing::warn!(dependency = %dep.name, "no repository declared, expecting it under charts/");
                continue;
            }

            let path = self
                .fetch(chart_dir, &charts_dir, dep, repository)
                .await
                .map_err(|e| RepoError::DependencyFailed {
                    name: dep.name.clone(),
                    message: e.to_string(),
                })?;
            tracing::info!(dependency = %dep.name, path = %path.display(), "dependency updated");
            written.push(path);
        }

        Ok(written)
    }

    async fn fetch(
        &self,
        chart_dir: &Path,
        charts_dir: &Path,
        dep: &Dependency,
        repository: &str,
    ) -> Result<PathBuf> {
        if let Some(relative) = repository.strip_prefix("file://") {
            let source = chart_dir.join(relative);
            let chart = LoadedChart::load_dir(&source)?;
            check_constraint(dep, &chart)?;
            remove_stale(charts_dir, &dep.name)?;
            let output = charts_dir.join(archive::archive_name(chart.name(), &chart.metadata.version));
            return Ok(archive::create_archive(&chart, &output)?);
        }

        let locate = self.resolver.locate_options_for(repository, &dep.version);
        let bytes = if repository.starts_with("oci://") {
            let version = locate.version.as_deref().ok_or_else(|| RepoError::MissingVersion {
                reference: format!("{}/{}", repository.trim_end_matches('/'), dep.name),
            })?;
            let reference = OciReference::for_chart(repository, &dep.name, version)?;
            let registry = locate.registry().ok_or_else(|| RepoError::MissingRegistryClient {
                reference: reference.to_string(),
            })?;
            registry.pull_chart(&reference).await?
        } else {
            let repo = HttpRepository::new(repository, locate.http_client()?)?;
            let entry = repo.locate(&dep.name, locate.version.as_deref()).await?;
            repo.download(&entry, locate.registry()).await?
        };

        let chart = LoadedChart::from_archive(&bytes)?;
        remove_stale(charts_dir, &dep.name)?;
        let output = charts_dir.join(archive::archive_name(chart.name(), &chart.metadata.version));
        std::fs::write(&output, &bytes)?;
        Ok(output)
    }
}

fn check_constraint(dep: &Dependency, chart: &LoadedChart) -> Result<()> {
    let raw = dep.version.trim();
    if raw.is_empty() || raw == "*" {
        return Ok(());
    }
    let req = semver::VersionReq::parse(raw).map_err(|e| RepoError::InvalidConstraint {
        constraint: raw.to_string(),
        reason: e.to_string(),
    })?;
    if req.matches(&chart.metadata.version) {
        Ok(())
    } else {
        Err(RepoError::UnsatisfiableConstraint {
            name: dep.name.clone(),
            constraint: raw.to_string(),
            available: chart.metadata.version.to_string(),
        })
    }
}

/// Remove previously fetched archives of the same dependency
fn remove_stale(charts_dir: &Path, name: &str) -> Result<()> {
    let prefix = format!("{}-", name);
    for entry in std::fs::read_dir(charts_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let version = file_name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".tgz"));
        if version.is_some_and(|v| semver::Version::parse(v).is_ok()) {
            tracing::debug!(file = %file_name, "removing stale dependency archive");
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
