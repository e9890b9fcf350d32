//! Chart reference resolution: local path, HTTP repository or OCI registry

use berth_core::{ChartMetadata, CoreError, LoadedChart, archive};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::credentials::{BasicAuth, ScopedCredentials, SecureHttpClient, TlsSettings};
use crate::dependency::DependencyManager;
use crate::error::{RepoError, Result};
use crate::http::HttpRepository;
use crate::oci::{OciReference, Registry, RegistryClient};

/// Where a chart comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartSource {
    /// Directory or `.tgz` on disk
    Local(PathBuf),
    /// Chart name in an HTTP repository
    Repository { url: String, name: String },
    /// Chart name under an `oci://` repository
    Oci { repository: String, name: String },
}

impl ChartSource {
    /// Classify a chart reference
    ///
    /// `./`, `../` and `/` prefixes, or a bare name that exists on disk, are
    /// local. Everything else needs a repository, unless the chart itself is
    /// a full `oci://` reference.
    pub fn classify(chart: &str, repository: Option<&str>) -> Result<Self> {
        if is_local_reference(chart) {
            return Ok(Self::Local(PathBuf::from(chart)));
        }

        if chart.starts_with("oci://") {
            let (repository, name) = chart.rsplit_once('/').ok_or_else(|| {
                RepoError::InvalidOciReference {
                    reference: chart.to_string(),
                }
            })?;
            return Ok(Self::Oci {
                repository: repository.to_string(),
                name: name.to_string(),
            });
        }

        let repository = repository
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| RepoError::MissingRepository {
                chart: chart.to_string(),
            })?;

        if repository.starts_with("oci://") {
            Ok(Self::Oci {
                repository: repository.trim_end_matches('/').to_string(),
                name: chart.to_string(),
            })
        } else {
            Ok(Self::Repository {
                url: repository.to_string(),
                name: chart.to_string(),
            })
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Classify and run every check that needs no network
    ///
    /// A missing repository and an OCI chart without a version fail here.
    pub fn validate(chart: &str, options: &ResolveOptions) -> Result<Self> {
        let source = Self::classify(chart, options.repository.as_deref())?;
        if let Self::Oci { repository, name } = &source {
            required_version(options, repository, name)?;
        }
        Ok(source)
    }
}

/// OCI charts have no index to pick a version from
fn required_version<'a>(options: &'a ResolveOptions, repository: &str, name: &str) -> Result<&'a str> {
    options
        .version
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RepoError::MissingVersion {
            reference: format!("{}/{}", repository, name),
        })
}

/// Whether a chart reference points at the local filesystem
pub fn is_local_reference(chart: &str) -> bool {
    chart.starts_with("./")
        || chart.starts_with("../")
        || chart.starts_with('/')
        || (!chart.contains("://") && !chart.is_empty() && Path::new(chart).exists())
}

/// Options supplied by the caller for one resolution
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Exact version or constraint; required for OCI
    pub version: Option<String>,
    pub repository: Option<String>,
    pub basic_auth: Option<BasicAuth>,
    pub tls: TlsSettings,
    /// Docker-style registry credential file
    pub registry_config: Option<PathBuf>,
    /// Send basic auth to hosts other than the repository
    pub pass_credentials: bool,
    /// Fetch declared dependencies into `charts/` before loading
    pub dependency_update: bool,
}

/// Options used while locating and downloading one chart
///
/// Built from the public surface of [`ResolveOptions`]. The registry client
/// is not part of that surface, so every rebuild must be followed by
/// [`LocateOptions::carry_forward`].
#[derive(Clone, Default)]
pub struct LocateOptions {
    pub version: Option<String>,
    pub repo_url: Option<String>,
    pub basic_auth: Option<BasicAuth>,
    pub tls: TlsSettings,
    pub pass_credentials: bool,
    registry: Option<Arc<dyn Registry>>,
}

impl From<&ResolveOptions> for LocateOptions {
    fn from(options: &ResolveOptions) -> Self {
        Self {
            version: options.version.clone(),
            repo_url: options.repository.clone(),
            basic_auth: options.basic_auth.clone(),
            tls: options.tls.clone(),
            pass_credentials: options.pass_credentials,
            registry: None,
        }
    }
}

impl std::fmt::Debug for LocateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocateOptions")
            .field("version", &self.version)
            .field("repo_url", &self.repo_url)
            .field("basic_auth", &self.basic_auth)
            .field("tls", &self.tls)
            .field("pass_credentials", &self.pass_credentials)
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

impl LocateOptions {
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn registry(&self) -> Option<&dyn Registry> {
        self.registry.as_deref()
    }

    /// Re-attach fields a rebuild from [`ResolveOptions`] cannot reproduce
    pub fn carry_forward(mut self, previous: &LocateOptions) -> Self {
        if self.registry.is_none() {
            self.registry = previous.registry.clone();
        }
        self
    }

    /// HTTP client with credentials scoped to the repository URL
    pub fn http_client(&self) -> Result<SecureHttpClient> {
        let mut scoped = ScopedCredentials::default();
        if let Some(auth) = &self.basic_auth {
            if self.pass_credentials {
                scoped.pass_everywhere(auth.clone());
            } else if let Some(url) = &self.repo_url {
                scoped.add(url, auth.clone());
            }
        }
        SecureHttpClient::new(scoped, &self.tls)
    }
}

/// Resolves chart references into loaded charts
pub struct ChartResolver {
    options: ResolveOptions,
    prepared: LocateOptions,
}

impl ChartResolver {
    /// Resolver with a real OCI registry client prepared up front
    ///
    /// HTTP repositories may redirect index entries to `oci://`, so the
    /// registry client exists before any chart is located.
    pub fn new(options: ResolveOptions) -> Result<Self> {
        let registry = RegistryClient::new(
            options.basic_auth.clone(),
            options.registry_config.clone(),
            &options.tls,
        )?;
        Ok(Self::with_registry(options, Arc::new(registry)))
    }

    pub fn with_registry(options: ResolveOptions, registry: Arc<dyn Registry>) -> Self {
        let prepared = LocateOptions::from(&options).with_registry(registry);
        Self { options, prepared }
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Locate options for the top-level chart
    pub fn locate_options(&self) -> LocateOptions {
        LocateOptions::from(&self.options).carry_forward(&self.prepared)
    }

    /// Locate options for a dependency in another repository
    ///
    /// Basic auth only follows when the dependency lives in the same
    /// repository or credentials are passed everywhere.
    pub(crate) fn locate_options_for(&self, repo_url: &str, version: &str) -> LocateOptions {
        let mut options = self.options.clone();
        let same_repo = options.repository.as_deref().map(|r| r.trim_end_matches('/'))
            == Some(repo_url.trim_end_matches('/'));
        if !same_repo && !options.pass_credentials {
            options.basic_auth = None;
        }
        options.repository = Some(repo_url.to_string());
        options.version = Some(version.to_string()).filter(|v| !v.is_empty());
        LocateOptions::from(&options).carry_forward(&self.prepared)
    }

    /// Resolve a chart reference to a loaded chart
    pub async fn resolve(&self, chart: &str) -> Result<LoadedChart> {
        let source = ChartSource::classify(chart, self.options.repository.as_deref())?;
        self.resolve_source(&source).await
    }

    pub async fn resolve_source(&self, source: &ChartSource) -> Result<LoadedChart> {
        match source {
            ChartSource::Local(path) => self.resolve_local(path).await,
            ChartSource::Oci { repository, name } => {
                let version = required_version(&self.options, repository, name)?;
                let reference = OciReference::for_chart(repository, name, version)?;

                let locate = self.locate_options();
                let registry = locate.registry().ok_or_else(|| RepoError::MissingRegistryClient {
                    reference: reference.to_string(),
                })?;
                tracing::info!(%reference, "pulling chart");
                let bytes = registry.pull_chart(&reference).await?;
                self.load_bytes(&bytes).await
            }
            ChartSource::Repository { url, name } => {
                let locate = self.locate_options();
                let repo = HttpRepository::new(url.clone(), locate.http_client()?)?;
                let entry = repo.locate(name, locate.version.as_deref()).await?;
                tracing::info!(chart = %entry.name, version = %entry.version, repo = %url, "downloading chart");
                let bytes = repo.download(&entry, locate.registry()).await?;
                self.load_bytes(&bytes).await
            }
        }
    }

    async fn resolve_local(&self, path: &Path) -> Result<LoadedChart> {
        let path = std::path::absolute(path)?;
        if !path.exists() {
            return Err(CoreError::ChartNotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        if path.is_file() {
            let bytes = std::fs::read(&path)?;
            return self.load_bytes(&bytes).await;
        }

        if self.options.dependency_update {
            self.refresh_dependencies(&path).await?;
        }
        Ok(LoadedChart::load_dir(&path)?)
    }

    /// Load archive bytes, refreshing dependencies through a scratch directory
    async fn load_bytes(&self, bytes: &[u8]) -> Result<LoadedChart> {
        let chart = LoadedChart::from_archive(bytes)?;
        if !self.options.dependency_update || chart.metadata.dependencies.is_empty() {
            return Ok(chart);
        }

        let scratch = tempfile::tempdir()?;
        archive::extract_archive(bytes, scratch.path())?;
        self.refresh_dependencies(scratch.path()).await?;

        let mut refreshed = LoadedChart::load_dir(scratch.path())?;
        refreshed.root = None;
        Ok(refreshed)
    }

    /// Download declared dependencies into `charts/`, if there are any
    pub async fn refresh_dependencies(&self, chart_dir: &Path) -> Result<Vec<PathBuf>> {
        let metadata = ChartMetadata::from_dir(chart_dir)?;
        if metadata.dependencies.is_empty() {
            tracing::debug!(chart = %metadata.name, "no dependencies declared, skipping refresh");
            return Ok(Vec::new());
        }

        DependencyManager::new(self)
            .update(chart_dir, &metadata.dependencies)
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn write_chart(dir: &Path, name: &str, version: &str, deps: &str) {
        std::fs::create_dir_all(dir.join("templates")).unwrap();
        std::fs::write(
            dir.join("Chart.yaml"),
            format!("apiVersion: v2\nname: {name}\nversion: {version}\n{deps}"),
        )
        .unwrap();
        std::fs::write(dir.join("values.yaml"), "replicaCount: 1\n").unwrap();
        std::fs::write(dir.join("templates/cm.yaml"), "kind: ConfigMap\n").unwrap();
    }

    pub(crate) fn chart_archive(name: &str, version: &str) -> Vec<u8> {
        let dir = TempDir::new().unwrap();
        write_chart(dir.path(), name, version, "");
        let chart = LoadedChart::load_dir(dir.path()).unwrap();
        let out = dir.path().join("out.tgz");
        archive::create_archive(&chart, &out).unwrap();
        std::fs::read(out).unwrap()
    }

    /// Registry double serving one archive and recording pulled references
    pub(crate) struct FakeRegistry {
        pub archive: Vec<u8>,
        pub pulled: Mutex<Vec<String>>,
    }

    impl FakeRegistry {
        pub(crate) fn new(archive: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                archive,
                pulled: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Registry for FakeRegistry {
        async fn pull_chart(&self, reference: &OciReference) -> Result<Vec<u8>> {
            self.pulled.lock().unwrap().push(reference.to_string());
            Ok(self.archive.clone())
        }
    }

    #[test]
    fn test_classify_local() {
        assert!(ChartSource::classify("./web", None).unwrap().is_local());
        assert!(ChartSource::classify("../web", None).unwrap().is_local());
        assert!(ChartSource::classify("/srv/charts/web", Some("https://x")).unwrap().is_local());

        let dir = TempDir::new().unwrap();
        let bare = dir.path().display().to_string();
        assert!(ChartSource::classify(&bare, None).unwrap().is_local());
    }

    #[test]
    fn test_classify_remote_requires_repository() {
        let err = ChartSource::classify("nginx", None).unwrap_err();
        assert!(matches!(err, RepoError::MissingRepository { .. }));
        assert!(err.is_configuration());

        assert!(matches!(
            ChartSource::classify("nginx", Some("  ")),
            Err(RepoError::MissingRepository { .. })
        ));
    }

    #[test]
    fn test_classify_by_scheme() {
        assert_eq!(
            ChartSource::classify("nginx", Some("https://charts.example.com")).unwrap(),
            ChartSource::Repository {
                url: "https://charts.example.com".into(),
                name: "nginx".into()
            }
        );
        assert_eq!(
            ChartSource::classify("nginx", Some("oci://ghcr.io/org/charts/")).unwrap(),
            ChartSource::Oci {
                repository: "oci://ghcr.io/org/charts".into(),
                name: "nginx".into()
            }
        );
        assert_eq!(
            ChartSource::classify("oci://ghcr.io/org/charts/nginx", None).unwrap(),
            ChartSource::Oci {
                repository: "oci://ghcr.io/org/charts".into(),
                name: "nginx".into()
            }
        );
    }

    #[test]
    fn test_validate_requires_oci_version() {
        let err = ChartSource::validate("oci://ghcr.io/org/charts/nginx", &ResolveOptions::default()).unwrap_err();
        assert!(matches!(err, RepoError::MissingVersion { ref reference } if reference == "oci://ghcr.io/org/charts/nginx"));

        let options = ResolveOptions {
            version: Some(" 1.2.0 ".into()),
            ..Default::default()
        };
        assert!(ChartSource::validate("oci://ghcr.io/org/charts/nginx", &options).is_ok());
        assert!(ChartSource::validate("./charts/nginx", &ResolveOptions::default()).is_ok());
    }

    #[tokio::test]
    async fn test_oci_without_version_fails_before_pull() {
        let registry = FakeRegistry::new(chart_archive("app", "1.0.0"));
        let resolver = ChartResolver::with_registry(
            ResolveOptions {
                repository: Some("oci://registry.example.com/charts".into()),
                ..Default::default()
            },
            registry.clone(),
        );

        let err = resolver.resolve("app").await.unwrap_err();
        assert!(matches!(err, RepoError::MissingVersion { .. }));
        assert!(registry.pulled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oci_pulls_exact_reference() {
        let registry = FakeRegistry::new(chart_archive("app", "1.0.0"));
        let resolver = ChartResolver::with_registry(
            ResolveOptions {
                repository: Some("oci://registry.example.com/charts".into()),
                version: Some("1.0.0".into()),
                ..Default::default()
            },
            registry.clone(),
        );

        let chart = resolver.resolve("app").await.unwrap();
        assert_eq!(chart.name(), "app");
        assert_eq!(
            *registry.pulled.lock().unwrap(),
            vec!["registry.example.com/charts/app:1.0.0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_local_chart() {
        let resolver = ChartResolver::with_registry(
            ResolveOptions::default(),
            FakeRegistry::new(Vec::new()),
        );
        let err = resolver.resolve("./does-not-exist").await.unwrap_err();
        assert!(matches!(err, RepoError::Chart(CoreError::ChartNotFound { .. })));
    }

    #[test]
    fn test_rebuilt_options_lose_registry_without_carry_forward() {
        let registry = FakeRegistry::new(Vec::new());
        let options = ResolveOptions {
            repository: Some("https://charts.example.com".into()),
            ..Default::default()
        };
        let prepared = LocateOptions::from(&options).with_registry(registry);

        let rebuilt = LocateOptions::from(&options);
        assert!(rebuilt.registry().is_none());
        assert!(rebuilt.carry_forward(&prepared).registry().is_some());
    }

    #[tokio::test]
    async fn test_http_index_entry_redirected_to_oci_uses_carried_registry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"
apiVersion: v1
entries:
  moved:
    - name: moved
      version: 0.5.0
      urls: ["oci://registry.example.com/charts/moved:0.5.0"]
"#,
            ))
            .mount(&server)
            .await;

        let registry = FakeRegistry::new(chart_archive("moved", "0.5.0"));
        let resolver = ChartResolver::with_registry(
            ResolveOptions {
                repository: Some(server.uri()),
                ..Default::default()
            },
            registry.clone(),
        );

        // the locate options handed to chart-path resolution are a rebuild
        assert!(resolver.locate_options().registry().is_some());

        let chart = resolver.resolve("moved").await.unwrap();
        assert_eq!(chart.metadata.version.to_string(), "0.5.0");
        assert_eq!(
            *registry.pulled.lock().unwrap(),
            vec!["registry.example.com/charts/moved:0.5.0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_http_repository_download_with_auth_and_digest() {
        let server = MockServer::start().await;
        let archive_bytes = chart_archive("web", "1.4.0");
        let digest = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(&archive_bytes))
        };

        Mock::given(method("GET"))
            .and(path("/index.yaml"))
            .and(wiremock::matchers::header("Authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "apiVersion: v1\nentries:\n  web:\n    - name: web\n      version: 1.4.0\n      urls: [web-1.4.0.tgz]\n      digest: {digest}\n    - name: web\n      version: 1.3.0\n      urls: [web-1.3.0.tgz]\n"
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/web-1.4.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive_bytes))
            .mount(&server)
            .await;

        let resolver = ChartResolver::with_registry(
            ResolveOptions {
                repository: Some(server.uri()),
                version: Some(">=1.0.0".into()),
                basic_auth: Some(BasicAuth::new("user", "pass")),
                ..Default::default()
            },
            FakeRegistry::new(Vec::new()),
        );

        let chart = resolver.resolve("web").await.unwrap();
        assert_eq!(chart.metadata.version.to_string(), "1.4.0");
    }

    #[tokio::test]
    async fn test_http_digest_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "apiVersion: v1\nentries:\n  web:\n    - name: web\n      version: 1.0.0\n      urls: [web-1.0.0.tgz]\n      digest: sha256:0000\n",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/web-1.0.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(chart_archive("web", "1.0.0")))
            .mount(&server)
            .await;

        let resolver = ChartResolver::with_registry(
            ResolveOptions {
                repository: Some(server.uri()),
                ..Default::default()
            },
            FakeRegistry::new(Vec::new()),
        );

        let err = resolver.resolve("web").await.unwrap_err();
        assert!(matches!(err, RepoError::IntegrityCheckFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_index() {
        let server = MockServer::start().await;
        let resolver = ChartResolver::with_registry(
            ResolveOptions {
                repository: Some(server.uri()),
                ..Default::default()
            },
            FakeRegistry::new(Vec::new()),
        );

        let err = resolver.resolve("web").await.unwrap_err();
        assert!(matches!(err, RepoError::IndexNotFound { .. }));
    }

    #[tokio::test]
    async fn test_local_refresh_skipped_without_dependencies() {
        let dir = TempDir::new().unwrap();
        write_chart(dir.path(), "solo", "1.0.0", "");

        let registry = FakeRegistry::new(Vec::new());
        let resolver = ChartResolver::with_registry(
            ResolveOptions {
                dependency_update: true,
                ..Default::default()
            },
            registry.clone(),
        );

        let chart = resolver.resolve(&dir.path().display().to_string()).await.unwrap();
        assert_eq!(chart.name(), "solo");
        assert!(!dir.path().join("charts").exists());
        assert!(registry.pulled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dependency_options_drop_foreign_credentials() {
        let resolver = ChartResolver::with_registry(
            ResolveOptions {
                repository: Some("https://charts.example.com".into()),
                basic_auth: Some(BasicAuth::new("u", "p")),
                ..Default::default()
            },
            FakeRegistry::new(Vec::new()),
        );

        let same = resolver.locate_options_for("https://charts.example.com/", "1.0.0");
        assert!(same.basic_auth.is_some());
        assert!(same.registry().is_some());

        let other = resolver.locate_options_for("https://other.example.com", "");
        assert!(other.basic_auth.is_none());
        assert_eq!(other.version, None);
    }
}
