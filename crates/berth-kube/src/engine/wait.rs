//! Readiness polling for workloads and jobs
//!
//! The waiter loops until everything is ready; callers bound it with
//! `tokio::time::timeout`.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;

use super::apply::{ManifestApplier, ManifestDocument};
use crate::error::{KubeError, Result};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of one readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Ready,
    Waiting(String),
    Failed(String),
}

pub struct ReadinessWaiter {
    client: kube::Client,
    interval: Duration,
}

impl ReadinessWaiter {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wait for every workload, and for jobs when `include_jobs`
    pub async fn wait_ready(&self, namespace: &str, documents: &[ManifestDocument], include_jobs: bool) -> Result<()> {
        let targets: Vec<&ManifestDocument> = documents
            .iter()
            .filter(|d| match d.gvk.kind.as_str() {
                "Deployment" | "StatefulSet" | "DaemonSet" => true,
                "Job" => include_jobs,
                _ => false,
            })
            .collect();

        loop {
            let probes = targets.iter().map(|document| {
                let ns = document.object.metadata.namespace.as_deref().unwrap_or(namespace);
                self.probe(ns, document)
            });
            let results = futures::future::try_join_all(probes).await?;

            let mut pending = Vec::new();
            for (document, readiness) in targets.iter().zip(results) {
                match readiness {
                    Readiness::Ready => {}
                    Readiness::Waiting(reason) => pending.push(format!("{}: {}", document.display_name(), reason)),
                    Readiness::Failed(reason) => {
                        return Err(KubeError::Operation {
                            title: format!("{} failed", document.display_name()),
                            detail: reason,
                        });
                    }
                }
            }

            if pending.is_empty() {
                return Ok(());
            }
            tracing::debug!(pending = ?pending, "waiting for resources");
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Wait for hook jobs to complete
    pub async fn wait_jobs(&self, namespace: &str, hooks: &[ManifestDocument]) -> Result<()> {
        let jobs: Vec<ManifestDocument> = hooks.iter().filter(|h| h.gvk.kind == "Job").cloned().collect();
        self.wait_ready(namespace, &jobs, true).await
    }

    /// Wait until none of the documents exist anymore
    pub async fn wait_deleted(
        &self,
        namespace: &str,
        applier: &ManifestApplier,
        documents: &[ManifestDocument],
    ) -> Result<()> {
        loop {
            let mut remaining = 0usize;
            for document in documents {
                match applier.exists(namespace, document).await {
                    Ok(true) => remaining += 1,
                    Ok(false) | Err(KubeError::InvalidManifest(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            if remaining == 0 {
                return Ok(());
            }
            tracing::debug!(remaining, "waiting for deletion");
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn probe(&self, namespace: &str, document: &ManifestDocument) -> Result<Readiness> {
        let name = document.name();
        Ok(match document.gvk.kind.as_str() {
            "Deployment" => self.fetch::<Deployment>(namespace, name).await?.map_or_else(missing, |d| deployment_readiness(&d)),
            "StatefulSet" => self.fetch::<StatefulSet>(namespace, name).await?.map_or_else(missing, |s| statefulset_readiness(&s)),
            "DaemonSet" => self.fetch::<DaemonSet>(namespace, name).await?.map_or_else(missing, |d| daemonset_readiness(&d)),
            "Job" => self.fetch::<Job>(namespace, name).await?.map_or_else(missing, |j| job_readiness(&j)),
            _ => Readiness::Ready,
        })
    }

    async fn fetch<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

fn missing() -> Readiness {
    Readiness::Waiting("not found".to_string())
}

/// Every replica updated, ready and available
fn deployment_readiness(deployment: &Deployment) -> Readiness {
    let status = deployment.status.as_ref();
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0);

    let stalled = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| {
            c.iter()
                .find(|cond| cond.type_ == "Progressing" && cond.reason.as_deref() == Some("ProgressDeadlineExceeded"))
        })
        .map(|cond| cond.message.clone().unwrap_or_else(|| "progress deadline exceeded".to_string()));
    if let Some(message) = stalled {
        return Readiness::Failed(message);
    }

    if ready >= desired && updated >= desired && available >= desired {
        Readiness::Ready
    } else {
        Readiness::Waiting(format!(
            "{}/{} ready, {}/{} updated, {}/{} available",
            ready, desired, updated, desired, available, desired
        ))
    }
}

/// All replicas ready and the rollout finished
fn statefulset_readiness(sts: &StatefulSet) -> Readiness {
    let status = sts.status.as_ref();
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let current_rev = status.and_then(|s| s.current_revision.as_ref());
    let update_rev = status.and_then(|s| s.update_revision.as_ref());

    if ready >= desired && current_rev == update_rev {
        Readiness::Ready
    } else {
        Readiness::Waiting(format!("{}/{} ready", ready, desired))
    }
}

fn daemonset_readiness(ds: &DaemonSet) -> Readiness {
    let Some(status) = ds.status.as_ref() else {
        return Readiness::Waiting("no status yet".to_string());
    };
    let desired = status.desired_number_scheduled;
    let ready = status.number_ready;
    let updated = status.updated_number_scheduled.unwrap_or(0);

    if ready >= desired && updated >= desired {
        Readiness::Ready
    } else {
        Readiness::Waiting(format!("{}/{} ready, {}/{} updated", ready, desired, updated, desired))
    }
}

fn job_readiness(job: &Job) -> Readiness {
    let status = job.status.as_ref();
    let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
    let failed = status.and_then(|s| s.failed).unwrap_or(0);
    let active = status.and_then(|s| s.active).unwrap_or(0);

    let failed_condition = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|cond| cond.type_ == "Failed" && cond.status == "True"));

    if let Some(cond) = failed_condition {
        return Readiness::Failed(
            cond.message
                .clone()
                .or_else(|| cond.reason.clone())
                .unwrap_or_else(|| "job failed".to_string()),
        );
    }
    if succeeded > 0 {
        Readiness::Ready
    } else {
        Readiness::Waiting(format!("{} active, {} failed", active, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(value: serde_json::Value) -> Deployment {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_deployment_readiness() {
        let ready = deployment(json!({
            "metadata": {"name": "web"},
            "spec": {"replicas": 2, "selector": {}, "template": {}},
            "status": {"readyReplicas": 2, "updatedReplicas": 2, "availableReplicas": 2}
        }));
        assert_eq!(deployment_readiness(&ready), Readiness::Ready);

        let rolling = deployment(json!({
            "metadata": {"name": "web"},
            "spec": {"replicas": 2, "selector": {}, "template": {}},
            "status": {"readyReplicas": 1, "updatedReplicas": 2, "availableReplicas": 1}
        }));
        assert!(matches!(deployment_readiness(&rolling), Readiness::Waiting(m) if m.contains("1/2 ready")));
    }

    #[test]
    fn test_deployment_progress_deadline_fails() {
        let stuck = deployment(json!({
            "metadata": {"name": "web"},
            "spec": {"replicas": 1, "selector": {}, "template": {}},
            "status": {"conditions": [{
                "type": "Progressing",
                "status": "False",
                "reason": "ProgressDeadlineExceeded",
                "message": "ReplicaSet \"web-1\" has timed out progressing."
            }]}
        }));
        assert!(matches!(deployment_readiness(&stuck), Readiness::Failed(m) if m.contains("timed out progressing")));
    }

    #[test]
    fn test_statefulset_waits_for_revision() {
        let sts: StatefulSet = serde_json::from_value(json!({
            "metadata": {"name": "db"},
            "spec": {"replicas": 1, "selector": {}, "serviceName": "db", "template": {}},
            "status": {"replicas": 1, "readyReplicas": 1, "currentRevision": "db-1", "updateRevision": "db-2"}
        }))
        .unwrap();
        assert!(matches!(statefulset_readiness(&sts), Readiness::Waiting(_)));
    }

    #[test]
    fn test_daemonset_without_status_waits() {
        let ds: DaemonSet = serde_json::from_value(json!({"metadata": {"name": "agent"}})).unwrap();
        assert!(matches!(daemonset_readiness(&ds), Readiness::Waiting(_)));
    }

    #[test]
    fn test_job_readiness() {
        let done: Job = serde_json::from_value(json!({
            "metadata": {"name": "migrate"},
            "status": {"succeeded": 1}
        }))
        .unwrap();
        assert_eq!(job_readiness(&done), Readiness::Ready);

        let failed: Job = serde_json::from_value(json!({
            "metadata": {"name": "migrate"},
            "status": {"failed": 6, "conditions": [{
                "type": "Failed", "status": "True", "reason": "BackoffLimitExceeded",
                "message": "Job has reached the specified backoff limit"
            }]}
        }))
        .unwrap();
        assert_eq!(
            job_readiness(&failed),
            Readiness::Failed("Job has reached the specified backoff limit".to_string())
        );
    }
}
