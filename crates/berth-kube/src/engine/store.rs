//! Release records kept in Kubernetes Secrets
//!
//! One Secret per revision, named `sh.berth.release.v1.<name>.v<revision>`,
//! holding the zstd-compressed JSON of an [`EngineRelease`].

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::BTreeMap;

use super::EngineRelease;
use crate::error::{KubeError, Result};

const MANAGED_BY: &str = "berth";
const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const LABEL_NAME: &str = "berth.io/release-name";
const LABEL_REVISION: &str = "berth.io/release-revision";
const LABEL_STATUS: &str = "berth.io/release-status";
const SECRET_TYPE: &str = "berth.io/release.v1";
const DATA_KEY: &str = "release";
const ZSTD_LEVEL: i32 = 3;

/// Secret name for a revision
pub fn record_key(name: &str, revision: u32) -> String {
    format!("sh.berth.release.v1.{}.v{}", name, revision)
}

/// Serialize and compress a record
pub fn encode_record(release: &EngineRelease) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(release)?;
    zstd::encode_all(std::io::Cursor::new(json), ZSTD_LEVEL)
        .map_err(|e| KubeError::Compression(e.to_string()))
}

/// Decompress and deserialize a record
pub fn decode_record(data: &[u8]) -> Result<EngineRelease> {
    let json = zstd::decode_all(std::io::Cursor::new(data))
        .map_err(|e| KubeError::Compression(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}

/// Secrets-backed release history
pub struct ReleaseStore {
    client: kube::Client,
}

impl ReleaseStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn build_secret(release: &EngineRelease) -> Result<Secret> {
        let labels = BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            (LABEL_NAME.to_string(), release.name.clone()),
            (LABEL_REVISION.to_string(), release.revision.to_string()),
            (LABEL_STATUS.to_string(), release.status.to_string()),
        ]);
        let data = BTreeMap::from([(DATA_KEY.to_string(), ByteString(encode_record(release)?))]);

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(record_key(&release.name, release.revision)),
                namespace: Some(release.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    fn parse_secret(secret: &Secret) -> Result<EngineRelease> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DATA_KEY))
            .ok_or_else(|| KubeError::Storage("secret is missing 'release' data".to_string()))?;
        decode_record(&data.0)
    }

    /// All revisions, newest first
    pub async fn history(&self, name: &str, namespace: &str) -> Result<Vec<EngineRelease>> {
        let selector = format!("{}={},{}={}", LABEL_MANAGED_BY, MANAGED_BY, LABEL_NAME, name);
        let secrets = self.api(namespace).list(&ListParams::default().labels(&selector)).await?;

        let mut releases = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            match Self::parse_secret(secret) {
                Ok(release) => releases.push(release),
                Err(e) => tracing::warn!(
                    secret = ?secret.metadata.name,
                    error = %e,
                    "skipping unreadable release record"
                ),
            }
        }
        releases.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(releases)
    }

    /// Latest revision, or `ReleaseNotFound`
    pub async fn latest(&self, name: &str, namespace: &str) -> Result<EngineRelease> {
        self.history(name, namespace)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    pub async fn create(&self, release: &EngineRelease) -> Result<()> {
        let secret = Self::build_secret(release)?;
        self.api(&release.namespace)
            .create(&PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    /// Overwrite an existing revision
    pub async fn update(&self, release: &EngineRelease) -> Result<()> {
        let secret = Self::build_secret(release)?;
        let key = record_key(&release.name, release.revision);
        self.api(&release.namespace)
            .replace(&key, &PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    /// Delete every revision of a release
    pub async fn delete_all(&self, name: &str, namespace: &str) -> Result<()> {
        let api = self.api(namespace);
        for release in self.history(name, namespace).await? {
            match api
                .delete(&record_key(name, release.revision), &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Keep only the newest `max_history` revisions; 0 keeps all
    pub async fn prune(&self, name: &str, namespace: &str, max_history: u32) -> Result<()> {
        if max_history == 0 {
            return Ok(());
        }
        let api = self.api(namespace);
        let history = self.history(name, namespace).await?;
        for old in history.iter().skip(max_history as usize) {
            tracing::debug!(release = %name, revision = old.revision, "pruning release history");
            match api
                .delete(&record_key(name, old.revision), &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{ReleaseStatus, Values};
    use chrono::Utc;

    fn sample() -> EngineRelease {
        EngineRelease {
            name: "web".into(),
            namespace: "apps".into(),
            revision: 3,
            status: ReleaseStatus::Deployed,
            chart_name: "web".into(),
            chart_version: "1.0.0".into(),
            app_version: None,
            config: Values::from_yaml("replicaCount: 2").unwrap(),
            manifest: "apiVersion: v1\nkind: ConfigMap\n".repeat(200),
            notes: Some("hello".into()),
            description: None,
            first_deployed: Utc::now(),
            last_deployed: Utc::now(),
        }
    }

    #[test]
    fn test_record_key() {
        assert_eq!(record_key("web", 3), "sh.berth.release.v1.web.v3");
    }

    #[test]
    fn test_record_is_compressed() {
        let release = sample();
        let encoded = encode_record(&release).unwrap();
        assert!(encoded.len() < serde_json::to_vec(&release).unwrap().len());
        assert_eq!(decode_record(&encoded).unwrap(), release);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode_record(b"not zstd"), Err(KubeError::Compression(_))));
    }

    #[test]
    fn test_secret_layout() {
        let secret = ReleaseStore::build_secret(&sample()).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("sh.berth.release.v1.web.v3"));
        assert_eq!(secret.type_.as_deref(), Some(SECRET_TYPE));
        let labels = secret.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_STATUS).map(String::as_str), Some("deployed"));
        assert_eq!(ReleaseStore::parse_secret(&secret).unwrap().revision, 3);
    }
}
