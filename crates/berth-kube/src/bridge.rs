//! Cluster client bridge
//!
//! The release engine talks to the cluster through [`ClientGetter`]: REST
//! config, cached discovery, GVK to API resource mapping and namespace
//! resolution. [`ClusterClient`] is the concrete adapter over `kube`.

use async_trait::async_trait;
use kube::core::GroupVersionKind;
use kube::discovery::{ApiResource, Discovery, Scope};
use tokio::sync::OnceCell;

use crate::connection::ConnectionConfig;
use crate::error::{KubeError, Result};

/// Context and namespace a client operates in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawConfig {
    pub context: Option<String>,
    pub namespace: String,
}

/// What the release engine needs from a cluster client
#[async_trait]
pub trait ClientGetter: Send + Sync {
    fn rest_config(&self) -> &kube::Config;

    fn client(&self) -> kube::Client;

    /// API discovery, run at most once per client
    async fn discovery(&self) -> Result<&Discovery>;

    /// Map a GVK to its API resource and scope
    async fn rest_mapper(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, Scope)> {
        let discovery = self.discovery().await?;
        discovery
            .resolve_gvk(gvk)
            .map(|(resource, caps)| (resource, caps.scope))
            .ok_or_else(|| {
                KubeError::InvalidManifest(format!(
                    "unknown resource type {}/{} {}",
                    gvk.group, gvk.version, gvk.kind
                ))
            })
    }

    /// Resolve the effective context and namespace
    fn raw_config(&self, namespace: Option<&str>) -> RawConfig;
}

/// Cluster client owned by one lifecycle operation
pub struct ClusterClient {
    connection: ConnectionConfig,
    config: kube::Config,
    client: kube::Client,
    discovery: OnceCell<Discovery>,
}

impl ClusterClient {
    /// Build a client from connection settings
    pub async fn connect(connection: ConnectionConfig) -> Result<Self> {
        let config = connection.to_kube_config().await?;
        Self::from_config(connection, config)
    }

    pub fn from_config(connection: ConnectionConfig, config: kube::Config) -> Result<Self> {
        let client = kube::Client::try_from(config.clone())?;
        Ok(Self {
            connection,
            config,
            client,
            discovery: OnceCell::new(),
        })
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }
}

#[async_trait]
impl ClientGetter for ClusterClient {
    fn rest_config(&self) -> &kube::Config {
        &self.config
    }

    fn client(&self) -> kube::Client {
        self.client.clone()
    }

    async fn discovery(&self) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                tracing::debug!("running API discovery");
                Discovery::new(self.client.clone())
                    .run()
                    .await
                    .map_err(KubeError::Api)
            })
            .await
    }

    fn raw_config(&self, namespace: Option<&str>) -> RawConfig {
        RawConfig {
            context: self.connection.context.clone(),
            namespace: resolve_namespace(namespace, Some(&self.config.default_namespace)),
        }
    }
}

/// Explicit namespace, else the context namespace, else `default`
pub fn resolve_namespace(explicit: Option<&str>, context_namespace: Option<&str>) -> String {
    explicit
        .filter(|ns| !ns.is_empty())
        .or(context_namespace.filter(|ns| !ns.is_empty()))
        .unwrap_or("default")
        .to_string()
}
