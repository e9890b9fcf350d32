//! OCI registry client
//!
//! Pulls chart archives stored as OCI artifacts. Only exact `name:version`
//! references are pulled; there is no "latest" lookup.

use async_trait::async_trait;
use oci_distribution::Reference;
use oci_distribution::client::{Certificate, CertificateEncoding, Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use std::path::PathBuf;

use crate::credentials::{BasicAuth, DockerConfig, TlsSettings};
use crate::error::{RepoError, Result};

/// Media types for charts in OCI
pub mod media_types {
    /// Chart config
    pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
    /// Chart content layer
    pub const HELM_CONTENT: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
}

/// Anything able to pull a chart archive from a registry
#[async_trait]
pub trait Registry: Send + Sync {
    /// Pull the chart content layer for a reference
    async fn pull_chart(&self, reference: &OciReference) -> Result<Vec<u8>>;
}

/// OCI registry client backed by `oci-distribution`
pub struct RegistryClient {
    client: Client,
    /// Explicit credentials; they win over the credential file
    explicit: Option<BasicAuth>,
    /// Docker-style credential file, `~/.docker/config.json` when unset
    config_file: Option<PathBuf>,
}

impl RegistryClient {
    pub fn new(
        explicit: Option<BasicAuth>,
        config_file: Option<PathBuf>,
        tls: &TlsSettings,
    ) -> Result<Self> {
        let mut extra_root_certificates = Vec::new();
        if let Some(ca) = &tls.ca_file {
            let data = std::fs::read(ca).map_err(|e| RepoError::Tls {
                message: format!("cannot read CA bundle {}: {}", ca.display(), e),
            })?;
            extra_root_certificates.push(Certificate {
                encoding: CertificateEncoding::Pem,
                data,
            });
        }

        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            accept_invalid_certificates: tls.insecure_skip_verify,
            extra_root_certificates,
            ..Default::default()
        };

        Ok(Self {
            client: Client::new(config),
            explicit,
            config_file,
        })
    }

    async fn auth_for(&self, registry: &str) -> Result<RegistryAuth> {
        if let Some(auth) = &self.explicit {
            return Ok(RegistryAuth::Basic(
                auth.username.clone(),
                auth.password.expose().clone(),
            ));
        }

        let config = DockerConfig::load(self.config_file.as_deref())?;
        Ok(match config.resolve(registry).await? {
            Some(auth) => RegistryAuth::Basic(auth.username, auth.password.into_inner()),
            None => RegistryAuth::Anonymous,
        })
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn pull_chart(&self, reference: &OciReference) -> Result<Vec<u8>> {
        let parsed = reference.to_reference()?;
        let auth = self.auth_for(&reference.registry).await?;

        tracing::debug!(reference = %reference, "pulling chart from registry");

        let image_data = self
            .client
            .pull(
                &parsed,
                &auth,
                vec![media_types::HELM_CONFIG, media_types::HELM_CONTENT],
            )
            .await
            .map_err(|e| RepoError::OciError {
                message: format!("Failed to pull {}: {}", reference, e),
            })?;

        let chart_layer = image_data
            .layers
            .into_iter()
            .find(|l| l.media_type == media_types::HELM_CONTENT)
            .ok_or_else(|| RepoError::OciError {
                message: format!("No chart content layer found in {}", reference),
            })?;

        Ok(chart_layer.data)
    }
}

/// A parsed `oci://registry/path/name:tag[@digest]` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl OciReference {
    /// Parse an OCI reference string
    pub fn parse(s: &str) -> Result<Self> {
        let clean = s
            .trim_start_matches("oci://")
            .trim_start_matches("https://")
            .trim_start_matches("http://");

        let (registry, rest) =
            clean
                .split_once('/')
                .ok_or_else(|| RepoError::InvalidOciReference {
                    reference: s.to_string(),
                })?;

        if registry.is_empty() || rest.is_empty() {
            return Err(RepoError::InvalidOciReference {
                reference: s.to_string(),
            });
        }

        let (repo_tag, digest) = match rest.rsplit_once('@') {
            Some((repo_tag, digest)) => (repo_tag, Some(digest.to_string())),
            None => (rest, None),
        };

        // A colon after the last slash separates the tag
        let last_segment_start = repo_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match repo_tag[last_segment_start..].rsplit_once(':') {
            Some((_, tag)) => (
                repo_tag[..repo_tag.len() - tag.len() - 1].to_string(),
                Some(tag.to_string()),
            ),
            None => (repo_tag.to_string(), None),
        };

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag,
            digest,
        })
    }

    /// Reference to `name` at `version` under a repository URL (`oci://host/path`)
    ///
    /// The version may carry a digest (`1.2.0@sha256:...`).
    pub fn for_chart(repository_url: &str, name: &str, version: &str) -> Result<Self> {
        let base = repository_url.trim_end_matches('/');
        Self::parse(&format!("{}/{}:{}", base, name, version))
    }

    /// Last path segment of the repository, i.e. the chart name
    pub fn chart_name(&self) -> &str {
        self.repository.rsplit('/').next().unwrap_or(&self.repository)
    }

    fn to_reference(&self) -> Result<Reference> {
        let raw = self.to_string();
        Reference::try_from(raw.as_str()).map_err(|e| RepoError::InvalidOciReference {
            reference: format!("{}: {}", raw, e),
        })
    }
}

impl std::fmt::Display for OciReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_tag() {
        let r = OciReference::parse("oci://ghcr.io/org/charts/nginx:1.2.3").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/charts/nginx");
        assert_eq!(r.tag.as_deref(), Some("1.2.3"));
        assert_eq!(r.digest, None);
        assert_eq!(r.chart_name(), "nginx");
    }

    #[test]
    fn test_parse_registry_with_port_and_digest() {
        let r = OciReference::parse("localhost:5000/charts/app:0.1.0@sha256:abc").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "charts/app");
        assert_eq!(r.tag.as_deref(), Some("0.1.0"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(r.to_string(), "localhost:5000/charts/app:0.1.0@sha256:abc");
    }

    #[test]
    fn test_parse_without_tag() {
        let r = OciReference::parse("oci://registry.example.com/charts/app").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.to_string(), "registry.example.com/charts/app");
    }

    #[test]
    fn test_for_chart() {
        let r = OciReference::for_chart("oci://ghcr.io/org/charts/", "redis", "17.0.1").unwrap();
        assert_eq!(r.to_string(), "ghcr.io/org/charts/redis:17.0.1");
    }

    #[test]
    fn test_invalid_reference() {
        assert!(OciReference::parse("oci://nohost").is_err());
        assert!(OciReference::parse("oci:///path").is_err());
    }

    #[test]
    fn test_client_reads_ca_file() {
        let tls = TlsSettings {
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(
            RegistryClient::new(None, None, &tls),
            Err(RepoError::Tls { .. })
        ));
        assert!(RegistryClient::new(Some(BasicAuth::new("u", "p")), None, &TlsSettings::default()).is_ok());
    }
}
