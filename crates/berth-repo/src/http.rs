//! HTTP chart repositories served with an `index.yaml`

use sha2::{Digest, Sha256};
use url::Url;

use crate::credentials::SecureHttpClient;
use crate::error::{RepoError, Result};
use crate::index::{ChartEntry, RepositoryIndex};
use crate::oci::{OciReference, Registry};

/// HTTP repository client
pub struct HttpRepository {
    url: String,
    client: SecureHttpClient,
}

impl HttpRepository {
    pub fn new(url: impl Into<String>, client: SecureHttpClient) -> Result<Self> {
        let url = url.into();
        let parsed = Url::parse(&url).map_err(|e| RepoError::InvalidRepositoryUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RepoError::InvalidRepositoryUrl {
                url,
                reason: "expected an http or https URL".to_string(),
            });
        }
        Ok(Self { url, client })
    }

    /// Get the repository URL
    pub fn url(&self) -> &str {
        &self.url
    }

    fn index_url(&self) -> String {
        format!("{}/index.yaml", self.url.trim_end_matches('/'))
    }

    /// Download and parse the repository index
    pub async fn fetch_index(&self) -> Result<RepositoryIndex> {
        let index_url = self.index_url();
        tracing::debug!(url = %index_url, "downloading repository index");

        let data = self.client.get_bytes(&index_url).await.map_err(|e| match e {
            RepoError::HttpError { status: 404, .. } => RepoError::IndexNotFound {
                url: index_url.clone(),
            },
            other => other,
        })?;
        RepositoryIndex::from_bytes(&data)
    }

    /// Find the entry for a chart name and version constraint
    pub async fn locate(&self, name: &str, version: Option<&str>) -> Result<ChartEntry> {
        let index = self.fetch_index().await?;
        let entry = index.find_chart(name, version, &self.url)?.clone();
        if entry.deprecated {
            tracing::warn!("chart {} {} is deprecated", entry.name, entry.version);
        }
        Ok(entry)
    }

    /// Download a chart archive
    ///
    /// Entries pointing at `oci://` are pulled through `registry`; without
    /// one the download fails with a missing registry client error.
    pub async fn download(&self, entry: &ChartEntry, registry: Option<&dyn Registry>) -> Result<Vec<u8>> {
        let url = entry.download_url().ok_or_else(|| RepoError::ChartNotFound {
            name: entry.name.clone(),
            repo: self.url.clone(),
        })?;

        if entry.is_oci() {
            let reference = OciReference::parse(url)?;
            let registry = registry.ok_or_else(|| RepoError::MissingRegistryClient {
                reference: url.to_string(),
            })?;
            tracing::debug!(%reference, "index entry redirects to an OCI registry");
            return registry.pull_chart(&reference).await;
        }

        let full_url = self.resolve_url(url)?;
        let data = self.client.get_bytes(&full_url).await?;

        if let Some(expected_digest) = entry.digest.as_deref().filter(|d| !d.is_empty()) {
            let actual_digest = compute_digest(&data);
            if !digest_matches(expected_digest, &actual_digest) {
                return Err(RepoError::IntegrityCheckFailed {
                    name: entry.name.clone(),
                    expected: expected_digest.to_string(),
                    actual: actual_digest,
                });
            }
        }

        Ok(data)
    }

    /// Resolve an entry URL against the repository URL
    fn resolve_url(&self, url: &str) -> Result<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.to_string());
        }
        let base = Url::parse(&format!("{}/", self.url.trim_end_matches('/')))?;
        Ok(base.join(url)?.to_string())
    }
}

/// Compute SHA256 digest of data
fn compute_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Check if two digests match (supports various formats)
fn digest_matches(expected: &str, actual: &str) -> bool {
    let normalize = |d: &str| {
        d.trim()
            .to_lowercase()
            .replace("sha256:", "")
            .replace("sha256-", "")
    };
    normalize(expected) == normalize(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_digest() {
        let digest = compute_digest(b"hello world");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), 7 + 64);
    }

    #[test]
    fn test_digest_matches() {
        assert!(digest_matches("sha256:abc123", "sha256:ABC123"));
        assert!(digest_matches("sha256:abc123", "abc123"));
        assert!(digest_matches("sha256:abc123", "sha256-abc123"));
        assert!(!digest_matches("sha256:abc123", "sha256:xyz789"));
    }

    #[test]
    fn test_resolve_relative_url() {
        let repo =
            HttpRepository::new("https://charts.example.com/stable", SecureHttpClient::public().unwrap())
                .unwrap();
        assert_eq!(
            repo.resolve_url("nginx-1.0.0.tgz").unwrap(),
            "https://charts.example.com/stable/nginx-1.0.0.tgz"
        );
        assert_eq!(
            repo.resolve_url("https://cdn.example.com/x.tgz").unwrap(),
            "https://cdn.example.com/x.tgz"
        );
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(HttpRepository::new("ftp://example.com", SecureHttpClient::public().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_oci_entry_without_registry_fails() {
        let repo = HttpRepository::new("https://charts.example.com", SecureHttpClient::public().unwrap())
            .unwrap();
        let entry = ChartEntry {
            name: "moved".into(),
            version: "0.5.0".into(),
            urls: vec!["oci://registry.example.com/charts/moved:0.5.0".into()],
            ..Default::default()
        };

        let err = repo.download(&entry, None).await.unwrap_err();
        assert!(matches!(err, RepoError::MissingRegistryClient { .. }));
        assert!(err.to_string().contains("missing registry client"));
    }
}
