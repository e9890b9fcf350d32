//! Berth Kube - Kubernetes integration for Berth
//!
//! This crate provides:
//! - **Connection**: kubeconfig or explicit-host settings, and a client cache
//!   keyed by connection fingerprint
//! - **Client bridge**: REST config, cached discovery and GVK mapping for the engine
//! - **Release engine**: install, upgrade, uninstall and get over release
//!   records kept in Secrets, with server-side apply and readiness waits
//! - **Lifecycle**: create, read, update, delete and import of tracked releases
//! - **Drift detection**: compare tracked state with the live release
//! - **Diagnostics**: classify failures and explain stuck pods

pub mod bridge;
pub mod connection;
pub mod diagnostics;
pub mod drift;
pub mod engine;
pub mod error;
pub mod import;
pub mod lifecycle;
pub mod render;

pub use bridge::{ClientGetter, ClusterClient, RawConfig, resolve_namespace};
pub use connection::{ClientCache, ConnectionConfig};
pub use diagnostics::{
    Category, Diagnosis, KubePodLister, Operation, OperationContext, PodLister, classify, diagnose,
    format_go_duration, suggested_timeout, summarize_pods,
};
pub use drift::{Drift, DriftKind, detect_drift};
pub use engine::{
    ApplyPolicy, EngineRelease, InstallRequest, KubeEngine, MockReleaseEngine, ReleaseEngine,
    UninstallRequest, UpgradeRequest, WaitStrategy,
};
pub use error::{KubeError, Result, mentions_auth_failure};
pub use import::ImportId;
pub use lifecycle::{
    ClusterHandle, ClusterProvider, Imported, KubeClusterProvider, ReadOutcome, ReleaseLifecycle,
    resolve_options,
};
pub use render::{ReleaseContext, Rendered, render_chart};
