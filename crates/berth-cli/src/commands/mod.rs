//! CLI commands

pub mod apply;
pub mod destroy;
pub mod import;
pub mod refresh;
pub mod show;

use berth_kube::{ConnectionConfig, KubeClusterProvider, ReleaseLifecycle};
use std::path::PathBuf;
use std::sync::Arc;

use crate::state::StateFile;

/// What every command works against: the cluster and the state file
pub struct Session {
    pub lifecycle: ReleaseLifecycle,
    pub state: StateFile,
}

impl Session {
    pub fn new(kubeconfig: Option<PathBuf>, state: PathBuf) -> Self {
        let base = ConnectionConfig::default().with_kubeconfig(kubeconfig);
        Self {
            lifecycle: ReleaseLifecycle::new(Arc::new(KubeClusterProvider::new()), base),
            state: StateFile::new(state),
        }
    }
}
