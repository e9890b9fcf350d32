//! Failure classification and diagnostics
//!
//! Engine errors arrive as text. They are classified by an ordered list of
//! substring rules, then enriched with whatever helps an operator act on
//! them: pod states for timeouts, remedies for a missing namespace.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{Api, ListParams};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::error::{KubeError, Result};

/// Most pod issues listed before the rest are summarized as a count
const MAX_POD_ISSUES: usize = 5;

/// Waiting reasons that are part of a normal start
const BENIGN_WAITING_REASONS: [&str; 2] = ["ContainerCreating", "PodInitializing"];

const MIN_SUGGESTED_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Timed out and was rolled back or uninstalled
    Rollback,
    Timeout,
    NamespaceNotFound,
    Unknown,
}

const ROLLBACK_KEYWORDS: [&str; 4] = ["rollback", "rolled back", "atomic", "uninstalling"];
const TIMEOUT_KEYWORDS: [&str; 4] = ["context deadline exceeded", "timed out waiting", "timeout", "not ready"];

fn any_of(message: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| message.contains(k))
}

type Rule = (fn(&str) -> bool, Category);

/// First matching rule wins
const RULES: [Rule; 3] = [
    (
        |m| any_of(m, &ROLLBACK_KEYWORDS) && any_of(m, &TIMEOUT_KEYWORDS),
        Category::Rollback,
    ),
    (|m| any_of(m, &TIMEOUT_KEYWORDS), Category::Timeout),
    (
        |m| m.contains("not found") && m.contains("namespace"),
        Category::NamespaceNotFound,
    ),
];

/// Classify raw error text, case-insensitively
pub fn classify(message: &str) -> Category {
    let lowered = message.to_lowercase();
    RULES
        .iter()
        .find(|(matches, _)| matches(&lowered))
        .map(|(_, category)| *category)
        .unwrap_or(Category::Unknown)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Upgrade,
    Uninstall,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Install => "install",
            Operation::Upgrade => "upgrade",
            Operation::Uninstall => "uninstall",
        })
    }
}

/// What was being attempted when the error occurred
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: Operation,
    pub release: String,
    pub namespace: String,
    pub timeout: Duration,
}

/// Actionable rendering of a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub category: Category,
    pub title: String,
    pub detail: String,
}

impl From<Diagnosis> for KubeError {
    fn from(diagnosis: Diagnosis) -> Self {
        KubeError::Operation {
            title: diagnosis.title,
            detail: diagnosis.detail,
        }
    }
}

/// Source of pods for timeout diagnostics
#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
}

pub struct KubePodLister {
    client: kube::Client,
}

impl KubePodLister {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Classify a failure and build its diagnosis
///
/// Pods are listed at most once, and only for timeouts and rollbacks. A
/// failing lister only loses the pod section.
pub async fn diagnose(message: &str, context: &OperationContext, pods: Option<&dyn PodLister>) -> Diagnosis {
    let category = classify(message);
    let OperationContext {
        operation,
        release,
        namespace,
        ..
    } = context;

    let (title, detail) = match category {
        Category::Rollback | Category::Timeout => {
            let pod_summary = match pods {
                Some(lister) => match lister.list_pods(namespace).await {
                    Ok(list) => Some(summarize_pods(namespace, &list)),
                    Err(e) => {
                        tracing::debug!(error = %e, "pod diagnostics unavailable");
                        None
                    }
                },
                None => None,
            };

            let title = if category == Category::Rollback {
                format!("{} of release \"{}\" failed and was rolled back", operation, release)
            } else {
                format!(
                    "{} of release \"{}\" timed out after {}",
                    operation,
                    release,
                    format_go_duration(context.timeout)
                )
            };

            let mut detail = message.to_string();
            if let Some(summary) = pod_summary {
                detail.push_str("\n\n");
                detail.push_str(&summary);
            }
            detail.push_str("\n\nSuggestions:\n");
            detail.push_str(&format!(
                "  - raise the timeout, e.g. timeout: {}\n",
                format_go_duration(suggested_timeout(context.timeout))
            ));
            detail.push_str(&format!("  - inspect the pods: kubectl get pods -n {}\n", namespace));
            if category == Category::Rollback {
                detail.push_str("  - set atomic: false to keep the failed release for inspection");
            } else {
                detail.push_str("  - set wait: false to return without waiting for readiness");
            }
            (title, detail)
        }
        Category::NamespaceNotFound => (
            format!("namespace \"{}\" does not exist", namespace),
            format!(
                "release \"{}\" cannot {} because namespace \"{}\" was not found.\n\n\
                 Either:\n  - set createNamespace: true on the release\n  - create it first: kubectl create namespace {}",
                release, operation, namespace, namespace
            ),
        ),
        Category::Unknown => (
            format!("{} of release \"{}\" failed", operation, release),
            format!("{} {} in namespace {}: {}", operation, release, namespace, message),
        ),
    };

    Diagnosis {
        category,
        title,
        detail,
    }
}

/// Describe why pods are not ready
pub fn summarize_pods(namespace: &str, pods: &[Pod]) -> String {
    if pods.is_empty() {
        return format!("No pods found in namespace {}.", namespace);
    }

    // Identical lines, e.g. two containers of one pod in the same state, count once
    let mut seen = HashSet::new();
    let issues: Vec<String> = pods
        .iter()
        .flat_map(pod_issues)
        .filter(|issue| seen.insert(issue.clone()))
        .collect();
    if issues.is_empty() {
        return format!(
            "{} pod(s) exist in namespace {} but are not ready yet.",
            pods.len(),
            namespace
        );
    }

    let mut summary = String::from("Pod issues:");
    for issue in issues.iter().take(MAX_POD_ISSUES) {
        summary.push_str("\n  - ");
        summary.push_str(issue);
    }
    if issues.len() > MAX_POD_ISSUES {
        summary.push_str(&format!("\n  ... and {} more issue(s)", issues.len() - MAX_POD_ISSUES));
    }
    summary
}

fn pod_issues(pod: &Pod) -> Vec<String> {
    let name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
    let mut issues = Vec::new();

    let Some(status) = &pod.status else {
        return issues;
    };

    let containers = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    for container in containers {
        if let Some(issue) = container_issue(container) {
            issues.push(format!("{}: {}", name, issue));
        }
    }

    for condition in status.conditions.iter().flatten() {
        if condition.type_ == "PodScheduled" && condition.status == "False" {
            let reason = condition.reason.as_deref().unwrap_or("Unschedulable");
            issues.push(with_message(name, reason, condition.message.as_deref()));
        }
    }

    issues
}

fn container_issue(container: &ContainerStatus) -> Option<String> {
    let state = container.state.as_ref()?;
    if let Some(waiting) = &state.waiting {
        let reason = waiting.reason.as_deref()?;
        if BENIGN_WAITING_REASONS.contains(&reason) {
            return None;
        }
        return Some(match &waiting.message {
            Some(message) => format!("{} ({})", reason, message),
            None => reason.to_string(),
        });
    }
    if let Some(terminated) = &state.terminated
        && terminated.exit_code != 0
    {
        let reason = terminated.reason.as_deref().unwrap_or("Terminated");
        return Some(format!("{} (exit code {})", reason, terminated.exit_code));
    }
    None
}

fn with_message(pod: &str, reason: &str, message: Option<&str>) -> String {
    match message {
        Some(message) => format!("{}: {} ({})", pod, reason, message),
        None => format!("{}: {}", pod, reason),
    }
}

/// Double the timeout, but never below a minute
pub fn suggested_timeout(timeout: Duration) -> Duration {
    timeout.saturating_mul(2).max(MIN_SUGGESTED_TIMEOUT)
}

/// `90s` -> `1m30s`, `1h` -> `1h0m0s`
pub fn format_go_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticPods(Vec<Pod>);

    #[async_trait]
    impl PodLister for StaticPods {
        async fn list_pods(&self, _namespace: &str) -> Result<Vec<Pod>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenLister;

    #[async_trait]
    impl PodLister for BrokenLister {
        async fn list_pods(&self, _namespace: &str) -> Result<Vec<Pod>> {
            Err(KubeError::Internal("connection reset".into()))
        }
    }

    fn context() -> OperationContext {
        OperationContext {
            operation: Operation::Install,
            release: "web".into(),
            namespace: "apps".into(),
            timeout: Duration::from_secs(300),
        }
    }

    fn waiting_pod(name: &str, reason: &str, message: Option<&str>) -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": name},
            "status": {"containerStatuses": [{
                "name": "app", "image": "app:1", "imageID": "", "ready": false, "restartCount": 3,
                "state": {"waiting": {"reason": reason, "message": message}}
            }]}
        }))
        .unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("timed out waiting for the condition"), Category::Timeout);
        assert_eq!(classify("context deadline exceeded"), Category::Timeout);
        assert_eq!(classify("Deployment is NOT READY"), Category::Timeout);
        assert_eq!(
            classify("release web failed, and has been uninstalled due to atomic being set: timed out waiting for the condition"),
            Category::Rollback
        );
        assert_eq!(
            classify("release web failed, and has been rolled back due to atomic being set: context deadline exceeded"),
            Category::Rollback
        );
        assert_eq!(classify("namespaces \"apps\" not found"), Category::NamespaceNotFound);
        assert_eq!(classify("rollback failed: conflict"), Category::Unknown);
        assert_eq!(classify("secret not found"), Category::Unknown);
    }

    #[test]
    fn test_suggested_timeout() {
        assert_eq!(format_go_duration(suggested_timeout(Duration::from_secs(30))), "1m0s");
        assert_eq!(format_go_duration(suggested_timeout(Duration::from_secs(5))), "1m0s");
        assert_eq!(format_go_duration(suggested_timeout(Duration::from_secs(300))), "10m0s");
    }

    #[test]
    fn test_suggested_timeout_saturates() {
        assert_eq!(suggested_timeout(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn test_summarize_counts_identical_issues_once() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {"name": "web-1"},
            "status": {"containerStatuses": [
                {
                    "name": "app", "image": "app:1", "imageID": "", "ready": false, "restartCount": 0,
                    "state": {"waiting": {"reason": "ImagePullBackOff"}}
                },
                {
                    "name": "sidecar", "image": "proxy:1", "imageID": "", "ready": false, "restartCount": 0,
                    "state": {"waiting": {"reason": "ImagePullBackOff"}}
                }
            ]}
        }))
        .unwrap();
        let others: Vec<Pod> = (2..7)
            .map(|i| waiting_pod(&format!("web-{}", i), "CrashLoopBackOff", None))
            .collect();
        let mut pods = vec![pod];
        pods.extend(others);

        let summary = summarize_pods("apps", &pods);
        assert_eq!(summary.matches("web-1: ImagePullBackOff").count(), 1);
        assert!(summary.contains("web-5: CrashLoopBackOff"));
        assert!(!summary.contains("web-6"));
        assert!(summary.ends_with("... and 1 more issue(s)"));
    }

    #[test]
    fn test_format_go_duration() {
        assert_eq!(format_go_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_go_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_go_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_go_duration(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(format_go_duration(Duration::from_secs(3725)), "1h2m5s");
    }

    #[test]
    fn test_summarize_no_pods() {
        assert_eq!(summarize_pods("apps", &[]), "No pods found in namespace apps.");
    }

    #[test]
    fn test_summarize_pods_without_issues() {
        let pods = vec![waiting_pod("web-1", "ContainerCreating", None)];
        assert!(summarize_pods("apps", &pods).contains("exist in namespace apps but are not ready yet"));
    }

    #[test]
    fn test_summarize_caps_issues() {
        let pods: Vec<Pod> = (0..7)
            .map(|i| waiting_pod(&format!("web-{}", i), "ImagePullBackOff", Some("pull access denied")))
            .collect();
        let summary = summarize_pods("apps", &pods);

        assert!(summary.contains("web-0: ImagePullBackOff (pull access denied)"));
        assert!(summary.contains("web-4"));
        assert!(!summary.contains("web-5"));
        assert!(summary.ends_with("... and 2 more issue(s)"));
    }

    #[test]
    fn test_terminated_and_unschedulable() {
        let crashed: Pod = serde_json::from_value(json!({
            "metadata": {"name": "job-1"},
            "status": {"initContainerStatuses": [{
                "name": "init", "image": "busybox", "imageID": "", "ready": false, "restartCount": 0,
                "state": {"terminated": {"exitCode": 1, "reason": "Error"}}
            }]}
        }))
        .unwrap();
        let pending: Pod = serde_json::from_value(json!({
            "metadata": {"name": "web-2"},
            "status": {"conditions": [{
                "type": "PodScheduled", "status": "False", "reason": "Unschedulable",
                "message": "0/3 nodes are available"
            }]}
        }))
        .unwrap();

        let summary = summarize_pods("apps", &[crashed, pending]);
        assert!(summary.contains("job-1: Error (exit code 1)"));
        assert!(summary.contains("web-2: Unschedulable (0/3 nodes are available)"));
    }

    #[tokio::test]
    async fn test_diagnose_timeout_with_pods() {
        let lister = StaticPods(vec![waiting_pod("web-1", "CrashLoopBackOff", None)]);
        let diagnosis = diagnose("timed out waiting for the condition", &context(), Some(&lister)).await;

        assert_eq!(diagnosis.category, Category::Timeout);
        assert!(diagnosis.title.contains("timed out after 5m0s"));
        assert!(diagnosis.detail.contains("web-1: CrashLoopBackOff"));
        assert!(diagnosis.detail.contains("timeout: 10m0s"));
        assert!(diagnosis.detail.contains("kubectl get pods -n apps"));
        assert!(diagnosis.detail.contains("wait: false"));
    }

    #[tokio::test]
    async fn test_diagnose_rollback_suggests_atomic() {
        let diagnosis = diagnose(
            "release web failed, and has been uninstalled due to atomic being set: timed out waiting for the condition",
            &context(),
            Some(&StaticPods(Vec::new())),
        )
        .await;
        assert_eq!(diagnosis.category, Category::Rollback);
        assert!(diagnosis.detail.contains("No pods found"));
        assert!(diagnosis.detail.contains("atomic: false"));
    }

    #[tokio::test]
    async fn test_diagnose_survives_lister_failure() {
        let diagnosis = diagnose("timed out waiting for the condition", &context(), Some(&BrokenLister)).await;
        assert_eq!(diagnosis.category, Category::Timeout);
        assert!(!diagnosis.detail.contains("connection reset"));
        assert!(diagnosis.detail.contains("Suggestions"));
    }

    #[tokio::test]
    async fn test_diagnose_namespace_and_unknown() {
        let missing = diagnose("namespaces \"apps\" not found", &context(), None).await;
        assert!(missing.detail.contains("createNamespace"));
        assert!(missing.detail.contains("kubectl create namespace apps"));

        let unknown = diagnose("admission webhook denied the request", &context(), None).await;
        assert_eq!(unknown.category, Category::Unknown);
        assert_eq!(
            unknown.detail,
            "install web in namespace apps: admission webhook denied the request"
        );

        let err: KubeError = unknown.into();
        assert!(err.to_string().starts_with("install of release \"web\" failed: "));
    }
}
