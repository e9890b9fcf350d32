//! Connection settings and the per-connection client cache

use base64::Engine as _;
use berth_core::Sensitive;
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{KubeError, Result};

/// Name used for the synthetic kubeconfig entries built from an explicit host
const SYNTHETIC_NAME: &str = "berth";

/// How to reach a cluster
///
/// With `host` set, a kubeconfig is synthesized from the explicit fields.
/// Otherwise the kubeconfig file (or `KUBECONFIG`, or in-cluster config) is
/// used, optionally pinned to `context`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Sensitive<String>>,

    #[serde(default)]
    pub insecure: bool,

    /// PEM-encoded cluster CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ca_certificate: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl ConnectionConfig {
    /// Ambient credentials for a kubeconfig context
    pub fn for_context(context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            ..Default::default()
        }
    }

    pub fn with_kubeconfig(mut self, path: Option<PathBuf>) -> Self {
        self.kubeconfig = path;
        self
    }

    /// Stable hash over every field that affects the resulting client
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |name: &str, value: Option<&str>| {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            match value {
                Some(v) => {
                    hasher.update([1u8]);
                    hasher.update(v.as_bytes());
                }
                None => hasher.update([0u8]),
            }
            hasher.update([0xffu8]);
        };

        let kubeconfig = self.kubeconfig.as_ref().map(|p| p.display().to_string());
        field("kubeconfig", kubeconfig.as_deref());
        field("context", self.context.as_deref());
        field("host", self.host.as_deref());
        field("token", self.token.as_ref().map(|t| t.expose().as_str()));
        field("insecure", Some(if self.insecure { "true" } else { "false" }));
        field("ca", self.cluster_ca_certificate.as_deref());
        field("proxy", self.proxy_url.as_deref());

        hex::encode(hasher.finalize())
    }

    /// Build the `kube::Config` for these settings
    pub async fn to_kube_config(&self) -> Result<kube::Config> {
        let mut config = match &self.host {
            Some(host) => {
                let kubeconfig = self.synthetic_kubeconfig(host)?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| KubeError::Config(e.to_string()))?
            }
            None => {
                let options = KubeConfigOptions {
                    context: self.context.clone(),
                    ..Default::default()
                };
                match (&self.kubeconfig, &self.context) {
                    (Some(path), _) => {
                        let kubeconfig = Kubeconfig::read_from(path)
                            .map_err(|e| KubeError::Config(format!("{}: {}", path.display(), e)))?;
                        kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                            .await
                            .map_err(|e| KubeError::Config(e.to_string()))?
                    }
                    (None, Some(_)) => kube::Config::from_kubeconfig(&options)
                        .await
                        .map_err(|e| KubeError::Config(e.to_string()))?,
                    (None, None) => kube::Config::infer()
                        .await
                        .map_err(|e| KubeError::Config(e.to_string()))?,
                }
            }
        };

        if self.insecure {
            config.accept_invalid_certs = true;
        }
        if self.host.is_none()
            && let Some(proxy) = &self.proxy_url
        {
            config.proxy_url = Some(
                proxy
                    .parse()
                    .map_err(|e| KubeError::Config(format!("invalid proxy URL '{}': {}", proxy, e)))?,
            );
        }

        Ok(config)
    }

    fn synthetic_kubeconfig(&self, host: &str) -> Result<Kubeconfig> {
        let mut cluster = serde_json::json!({ "server": host });
        if let Some(ca) = &self.cluster_ca_certificate {
            cluster["certificate-authority-data"] =
                base64::engine::general_purpose::STANDARD.encode(ca.as_bytes()).into();
        }
        if self.insecure {
            cluster["insecure-skip-tls-verify"] = true.into();
        }
        if let Some(proxy) = &self.proxy_url {
            cluster["proxy-url"] = proxy.clone().into();
        }

        let mut user = serde_json::json!({});
        if let Some(token) = &self.token {
            user["token"] = token.expose().clone().into();
        }

        let document = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": SYNTHETIC_NAME, "cluster": cluster }],
            "users": [{ "name": SYNTHETIC_NAME, "user": user }],
            "contexts": [{
                "name": SYNTHETIC_NAME,
                "context": { "cluster": SYNTHETIC_NAME, "user": SYNTHETIC_NAME }
            }],
            "current-context": SYNTHETIC_NAME,
        });

        let yaml = serde_yaml::to_string(&document)?;
        Kubeconfig::from_yaml(&yaml).map_err(|e| KubeError::Config(e.to_string()))
    }
}

/// Clients keyed by connection fingerprint
///
/// Read-mostly; a miss takes the write lock and checks again before
/// building, so concurrent callers share one client per fingerprint.
pub struct ClientCache<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Default for ClientCache<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> ClientCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entry for `key`, or the result of `build`
    pub async fn get_or_try_insert_with<F, Fut>(&self, key: &str, build: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(existing) = self.entries.read().await.get(key) {
            return Ok(Arc::clone(existing));
        }

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key) {
            return Ok(Arc::clone(existing));
        }

        tracing::debug!(fingerprint = %key, "creating cluster client");
        let value = Arc::new(build().await?);
        entries.insert(key.to_string(), Arc::clone(&value));
        Ok(value)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
