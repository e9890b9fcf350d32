//! Tracked release state on disk
//!
//! One pretty-printed JSON `TrackedRelease` per file. Writes go through a
//! sibling temp file and a rename so a crash never leaves half a document.

use berth_core::TrackedRelease;
use std::path::{Path, PathBuf};

use crate::error::{CliError, Result};

pub const DEFAULT_STATE_FILE: &str = "berth.state.json";

pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The tracked release, if the file exists
    pub fn load(&self) -> Result<Option<TrackedRelease>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CliError::io_at(&self.path, e)),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// The tracked release; a missing file is an error
    pub fn require(&self) -> Result<TrackedRelease> {
        self.load()?.ok_or_else(|| CliError::not_tracked(&self.path))
    }

    pub fn save(&self, release: &TrackedRelease) -> Result<()> {
        let json = serde_json::to_string_pretty(release)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CliError::io_at(parent, e))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json + "\n").map_err(|e| CliError::io_at(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CliError::io_at(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), revision = release.state.revision, "state saved");
        Ok(())
    }

    /// Forget the release; a missing file is fine
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CliError::io_at(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{ReleaseSpec, ReleaseState, ReleaseStatus, Sensitive};

    fn tracked() -> TrackedRelease {
        let mut spec = ReleaseSpec::new("web", "apps", "./charts/web");
        spec.version = Some("1.2.0".to_string());
        TrackedRelease {
            spec,
            state: ReleaseState {
                id: "abc123".to_string(),
                revision: 3,
                status: ReleaseStatus::Deployed,
                manifest: Sensitive::new("kind: Secret".to_string()),
                chart_name: "web".to_string(),
                chart_version: "1.2.0".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join("absent.json"));
        assert!(state.load().unwrap().is_none());
        assert!(matches!(state.require(), Err(CliError::NotTracked { .. })));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join("nested/state.json"));
        state.save(&tracked()).unwrap();

        let loaded = state.require().unwrap();
        assert_eq!(loaded, tracked());
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join("state.json"));
        state.save(&tracked()).unwrap();
        state.remove().unwrap();
        state.remove().unwrap();
        assert!(state.load().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(StateFile::new(path).load().is_err());
    }
}
