//! Drift between tracked state and the live release

use berth_core::TrackedRelease;
use berth_repo::is_local_reference;
use semver::Version;
use std::fmt;
use std::path::Path;

use crate::engine::EngineRelease;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftKind {
    Revision,
    Version,
    Chart,
    Status,
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriftKind::Revision => "revision",
            DriftKind::Version => "version",
            DriftKind::Chart => "chart",
            DriftKind::Status => "status",
        })
    }
}

/// One observed difference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub kind: DriftKind,
    pub message: String,
}

impl Drift {
    fn new(kind: DriftKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} drift: {}", self.kind, self.message)
    }
}

/// Compare what was last recorded against what the cluster reports
pub fn detect_drift(tracked: &TrackedRelease, live: &EngineRelease) -> Vec<Drift> {
    let mut drift = Vec::new();
    let state = &tracked.state;

    if state.revision != live.revision {
        drift.push(Drift::new(
            DriftKind::Revision,
            format!(
                "release was modified outside berth: tracked revision {}, live revision {}",
                state.revision, live.revision
            ),
        ));
    }

    let expected_version = expected_version(tracked);
    if !expected_version.is_empty() && normalize_version(&live.chart_version) != expected_version {
        drift.push(Drift::new(
            DriftKind::Version,
            format!(
                "chart version changed: expected {}, live {}",
                expected_version, live.chart_version
            ),
        ));
    }

    if !chart_matches(&tracked.spec.chart, &live.chart_name) {
        drift.push(Drift::new(
            DriftKind::Chart,
            format!(
                "chart changed: expected {}, live {}",
                tracked.spec.chart, live.chart_name
            ),
        ));
    }

    if live.status.is_problematic() {
        drift.push(Drift::new(
            DriftKind::Status,
            format!("release status is {}", live.status),
        ));
    }

    drift
}

/// An exact requested version wins; ranges fall back to the recorded version
fn expected_version(tracked: &TrackedRelease) -> String {
    tracked
        .spec
        .version
        .as_deref()
        .map(normalize_version)
        .filter(|v| Version::parse(v).is_ok())
        .unwrap_or_else(|| normalize_version(&tracked.state.chart_version))
}

/// Drop an `@sha256:` digest and a leading `v`
fn normalize_version(version: &str) -> String {
    let version = version.trim();
    let version = version.split_once('@').map_or(version, |(v, _)| v);
    version.strip_prefix('v').unwrap_or(version).to_string()
}

fn chart_matches(reference: &str, live_name: &str) -> bool {
    if let Some(rest) = reference.strip_prefix("oci://") {
        let last = rest.rsplit('/').next().unwrap_or(rest);
        let last = last.split(['@', ':']).next().unwrap_or(last);
        return last == live_name;
    }

    if is_local_reference(reference) {
        let base = Path::new(reference.trim_end_matches('/'))
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = base.strip_suffix(".tgz").unwrap_or(&base);
        // `web-1.2.0.tgz` packages chart `web`
        return base == live_name
            || base
                .strip_prefix(live_name)
                .and_then(|rest| rest.strip_prefix('-'))
                .is_some_and(|version| Version::parse(version).is_ok());
    }

    let name = reference.rsplit('/').next().unwrap_or(reference);
    name == live_name
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{ReleaseSpec, ReleaseState, ReleaseStatus, Values};
    use chrono::Utc;

    fn tracked(chart: &str, version: Option<&str>, revision: u32, state_version: &str) -> TrackedRelease {
        let mut spec = ReleaseSpec::new("web", "apps", chart);
        spec.version = version.map(str::to_string);
        TrackedRelease {
            spec,
            state: ReleaseState {
                revision,
                chart_name: "web".into(),
                chart_version: state_version.into(),
                status: ReleaseStatus::Deployed,
                ..Default::default()
            },
        }
    }

    fn live(revision: u32, version: &str, status: ReleaseStatus) -> EngineRelease {
        EngineRelease {
            name: "web".into(),
            namespace: "apps".into(),
            revision,
            status,
            chart_name: "web".into(),
            chart_version: version.into(),
            app_version: None,
            config: Values::new(),
            manifest: String::new(),
            notes: None,
            description: None,
            first_deployed: Utc::now(),
            last_deployed: Utc::now(),
        }
    }

    #[test]
    fn test_no_drift() {
        let drift = detect_drift(
            &tracked("web", Some("1.2.0"), 2, "1.2.0"),
            &live(2, "1.2.0", ReleaseStatus::Deployed),
        );
        assert!(drift.is_empty(), "{:?}", drift);
    }

    #[test]
    fn test_revision_drift_carries_both_numbers() {
        let drift = detect_drift(
            &tracked("web", None, 2, "1.2.0"),
            &live(5, "1.2.0", ReleaseStatus::Deployed),
        );
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].kind, DriftKind::Revision);
        assert!(drift[0].message.contains('2'));
        assert!(drift[0].message.contains('5'));
    }

    #[test]
    fn test_version_digest_stripped() {
        let drift = detect_drift(
            &tracked("oci://registry.example.com/charts/web", Some("1.2.0@sha256:abcd"), 1, "1.2.0"),
            &live(1, "1.2.0", ReleaseStatus::Deployed),
        );
        assert!(drift.is_empty(), "{:?}", drift);

        let drift = detect_drift(
            &tracked("web", Some("1.2.0"), 1, "1.2.0"),
            &live(1, "1.3.0", ReleaseStatus::Deployed),
        );
        assert_eq!(drift[0].kind, DriftKind::Version);
    }

    #[test]
    fn test_version_range_uses_recorded_version() {
        let drift = detect_drift(
            &tracked("web", Some("^1.0"), 1, "1.4.0"),
            &live(1, "1.4.0", ReleaseStatus::Deployed),
        );
        assert!(drift.is_empty(), "{:?}", drift);
    }

    #[test]
    fn test_local_chart_compares_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let chart_dir = dir.path().join("web");
        std::fs::create_dir(&chart_dir).unwrap();
        let path = chart_dir.display().to_string();

        let drift = detect_drift(&tracked(&path, None, 1, "1.0.0"), &live(1, "1.0.0", ReleaseStatus::Deployed));
        assert!(drift.is_empty(), "{:?}", drift);

        assert!(chart_matches("./charts/web-1.0.0.tgz", "web"));
        assert!(chart_matches("./charts/web.tgz", "web"));
        assert!(!chart_matches("./charts/api-1.0.0.tgz", "web"));
    }

    #[test]
    fn test_chart_name_drift() {
        assert!(chart_matches("oci://registry.example.com/charts/web:1.0.0", "web"));
        assert!(chart_matches("stable/web", "web"));
        let drift = detect_drift(&tracked("api", None, 1, "1.0.0"), &live(1, "1.0.0", ReleaseStatus::Deployed));
        assert_eq!(drift[0].kind, DriftKind::Chart);
    }

    #[test]
    fn test_status_drift() {
        for status in [ReleaseStatus::Failed, ReleaseStatus::Superseded, ReleaseStatus::Uninstalling] {
            let drift = detect_drift(&tracked("web", None, 1, "1.0.0"), &live(1, "1.0.0", status));
            assert_eq!(drift.len(), 1);
            assert_eq!(drift[0].kind, DriftKind::Status);
        }
        let drift = detect_drift(
            &tracked("web", None, 1, "1.0.0"),
            &live(1, "1.0.0", ReleaseStatus::PendingUpgrade),
        );
        assert!(drift.is_empty());
    }
}
