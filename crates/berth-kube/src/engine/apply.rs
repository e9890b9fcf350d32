//! Applying and deleting rendered manifests
//!
//! Documents are parsed without cluster access; GVKs are resolved through
//! [`ClientGetter::rest_mapper`] only when something is sent to the API.

use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::core::{GroupVersionKind, TypeMeta};
use kube::discovery::Scope;
use std::collections::HashSet;
use std::sync::Arc;

use super::ApplyPolicy;
use crate::bridge::ClientGetter;
use crate::error::{KubeError, Result};

/// Field manager for server-side apply
const FIELD_MANAGER: &str = "berth";

const HOOK_ANNOTATIONS: [&str; 2] = ["helm.sh/hook", "berth.io/hook"];
const RESOURCE_POLICY_ANNOTATIONS: [&str; 2] = ["helm.sh/resource-policy", "berth.io/resource-policy"];

/// One object from a rendered manifest
#[derive(Debug, Clone)]
pub struct ManifestDocument {
    pub object: DynamicObject,
    pub gvk: GroupVersionKind,
}

impl ManifestDocument {
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or("")
    }

    /// `Kind/name`, for logs and errors
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.gvk.kind, self.name())
    }

    /// Identity used to compare two revisions' manifests
    pub fn key(&self) -> (String, String, String, Option<String>) {
        (
            self.gvk.group.clone(),
            self.gvk.kind.clone(),
            self.name().to_string(),
            self.object.metadata.namespace.clone(),
        )
    }

    /// Hook phases declared on the object, e.g. `pre-install`
    pub fn hook_phases(&self) -> Vec<String> {
        let Some(annotations) = &self.object.metadata.annotations else {
            return Vec::new();
        };
        HOOK_ANNOTATIONS
            .iter()
            .filter_map(|key| annotations.get(*key))
            .flat_map(|value| value.split(','))
            .map(|phase| phase.trim().to_string())
            .filter(|phase| !phase.is_empty())
            .collect()
    }

    fn keeps_on_delete(&self) -> bool {
        self.object
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| {
                RESOURCE_POLICY_ANNOTATIONS
                    .iter()
                    .any(|key| a.get(*key).map(String::as_str) == Some("keep"))
            })
    }
}

/// Whether an object carries a hook annotation
pub fn is_hook(object: &DynamicObject) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| HOOK_ANNOTATIONS.iter().any(|key| a.contains_key(*key)))
}

/// A rendered manifest split into hooks and regular resources
#[derive(Debug, Clone, Default)]
pub struct ParsedManifest {
    pub hooks: Vec<ManifestDocument>,
    pub resources: Vec<ManifestDocument>,
}

impl ParsedManifest {
    pub fn parse(manifest: &str) -> Result<Self> {
        let mut parsed = Self::default();

        for (index, doc) in manifest.split("\n---").enumerate() {
            let doc = doc.trim().trim_start_matches("---").trim();
            if doc
                .lines()
                .all(|l| l.trim().is_empty() || l.trim().starts_with('#'))
            {
                continue;
            }

            let object: DynamicObject = serde_yaml::from_str(doc)
                .map_err(|e| KubeError::InvalidManifest(format!("document {}: {}", index, e)))?;
            let types = object.types.as_ref().ok_or_else(|| {
                KubeError::InvalidManifest(format!("document {}: missing apiVersion or kind", index))
            })?;
            if object.metadata.name.as_deref().is_none_or(str::is_empty) {
                return Err(KubeError::InvalidManifest(format!(
                    "document {}: {} has no metadata.name",
                    index, types.kind
                )));
            }

            let document = ManifestDocument {
                gvk: gvk_from_type_meta(types),
                object,
            };
            if is_hook(&document.object) {
                parsed.hooks.push(document);
            } else {
                parsed.resources.push(document);
            }
        }

        Ok(parsed)
    }

    /// Hooks registered for a phase
    pub fn hooks_for(&self, phase: &str) -> Vec<ManifestDocument> {
        self.hooks
            .iter()
            .filter(|h| h.hook_phases().iter().any(|p| p == phase))
            .cloned()
            .collect()
    }

    /// Resources here that `previous` did not have
    pub fn added_since(&self, previous: &ParsedManifest) -> Vec<ManifestDocument> {
        let known: HashSet<_> = previous.resources.iter().map(ManifestDocument::key).collect();
        self.resources
            .iter()
            .filter(|r| !known.contains(&r.key()))
            .cloned()
            .collect()
    }

    /// Resources `previous` had that are gone here
    pub fn removed_since(&self, previous: &ParsedManifest) -> Vec<ManifestDocument> {
        previous.added_since(self)
    }
}

/// Sends manifest objects to the cluster
pub struct ManifestApplier {
    getter: Arc<dyn ClientGetter>,
}

impl ManifestApplier {
    pub fn new(getter: Arc<dyn ClientGetter>) -> Self {
        Self { getter }
    }

    /// Apply documents in dependency order
    pub async fn apply(
        &self,
        namespace: &str,
        documents: &[ManifestDocument],
        policy: ApplyPolicy,
        dry_run: bool,
    ) -> Result<()> {
        let mut ordered: Vec<&ManifestDocument> = documents.iter().collect();
        ordered.sort_by_key(|d| kind_priority(&d.gvk.kind));

        for document in ordered {
            let (api, object) = self.api_for(namespace, document).await?;
            let name = document.name();

            if policy.server_side {
                let mut params = PatchParams::apply(FIELD_MANAGER);
                params.force = policy.force_conflicts;
                params.dry_run = dry_run;
                api.patch(name, &params, &Patch::Apply(&object))
                    .await
                    .map_err(|e| apply_error(document, e))?;
            } else {
                let params = PostParams {
                    dry_run,
                    field_manager: Some(FIELD_MANAGER.to_string()),
                };
                match api.get_opt(name).await? {
                    Some(existing) => {
                        let mut replacement = object.clone();
                        replacement.metadata.resource_version = existing.metadata.resource_version;
                        api.replace(name, &params, &replacement)
                            .await
                            .map_err(|e| apply_error(document, e))?;
                    }
                    None => {
                        api.create(&params, &object)
                            .await
                            .map_err(|e| apply_error(document, e))?;
                    }
                }
            }
            tracing::debug!(resource = %document.display_name(), dry_run, "applied");
        }

        Ok(())
    }

    /// Delete documents in reverse dependency order
    ///
    /// Missing objects and objects annotated `resource-policy: keep` are skipped.
    pub async fn delete(&self, namespace: &str, documents: &[ManifestDocument]) -> Result<()> {
        let mut ordered: Vec<&ManifestDocument> = documents.iter().collect();
        ordered.sort_by_key(|d| std::cmp::Reverse(kind_priority(&d.gvk.kind)));

        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };

        for document in ordered {
            if document.keeps_on_delete() {
                tracing::info!(resource = %document.display_name(), "kept by resource policy");
                continue;
            }
            let (api, _) = match self.api_for(namespace, document).await {
                Ok(found) => found,
                // A CRD deleted earlier takes its custom resources' API with it
                Err(KubeError::InvalidManifest(reason)) => {
                    tracing::debug!(resource = %document.display_name(), %reason, "skipping delete");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match api.delete(document.name(), &params).await {
                Ok(_) => tracing::debug!(resource = %document.display_name(), "deleted"),
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Whether a document's object still exists
    pub async fn exists(&self, namespace: &str, document: &ManifestDocument) -> Result<bool> {
        let (api, _) = self.api_for(namespace, document).await?;
        Ok(api.get_opt(document.name()).await?.is_some())
    }

    async fn api_for(
        &self,
        namespace: &str,
        document: &ManifestDocument,
    ) -> Result<(Api<DynamicObject>, DynamicObject)> {
        let (resource, scope) = self.getter.rest_mapper(&document.gvk).await?;
        let client = self.getter.client();
        let mut object = document.object.clone();

        let api = if scope == Scope::Namespaced {
            let ns = object
                .metadata
                .namespace
                .get_or_insert_with(|| namespace.to_string())
                .clone();
            Api::namespaced_with(client, &ns, &resource)
        } else {
            object.metadata.namespace = None;
            Api::all_with(client, &resource)
        };
        Ok((api, object))
    }
}

fn apply_error(document: &ManifestDocument, error: kube::Error) -> KubeError {
    match error {
        kube::Error::Api(mut resp) => {
            resp.message = format!("{}: {}", document.display_name(), resp.message);
            KubeError::Api(kube::Error::Api(resp))
        }
        other => KubeError::Api(other),
    }
}

/// Creation order: cluster prerequisites first, workloads late
fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" | "ClusterRole" | "ClusterRoleBinding" | "Role" | "RoleBinding" => 2,
        "ConfigMap" | "Secret" | "PersistentVolumeClaim" | "StorageClass" => 3,
        "Service" | "Ingress" | "NetworkPolicy" => 4,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Pod" => 5,
        "Job" | "CronJob" => 6,
        _ => 7,
    }
}

/// `apps/v1` splits into group and version; `v1` is the core group
fn gvk_from_type_meta(tm: &TypeMeta) -> GroupVersionKind {
    let (group, version) = match tm.api_version.rsplit_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), tm.api_version.clone()),
    };
    GroupVersionKind {
        group,
        version,
        kind: tm.kind.clone(),
    }
}
