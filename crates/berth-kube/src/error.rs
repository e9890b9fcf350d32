//! Error types for berth-kube

use berth_core::CoreError;
use berth_repo::RepoError;
use thiserror::Error;

/// Result type for berth-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur during cluster operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Connection settings could not be turned into a client configuration
    #[error("invalid connection configuration: {0}")]
    Config(String),

    /// Release not found
    #[error("no release named '{name}' is recorded in '{namespace}'")]
    ReleaseNotFound { name: String, namespace: String },

    /// Values or chart loading error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Chart could not be resolved
    #[error("failed to resolve chart: {0}")]
    Resolution(#[from] RepoError),

    /// Install/upgrade/uninstall failure after classification
    #[error("{title}: {detail}")]
    Operation { title: String, detail: String },

    /// Import identifier does not match `context:name` or `context:namespace:name`
    #[error("invalid import ID '{id}': {reason}\nHint: expected 'context:release-name' or 'context:namespace:release-name'")]
    InvalidImportId { id: String, reason: String },

    /// Field that forces a replacement was changed on update
    #[error("cannot change '{field}' of an existing release ('{from}' -> '{to}'); it must be replaced")]
    ImmutableField {
        field: String,
        from: String,
        to: String,
    },

    /// Timeout
    #[error("{0}")]
    Timeout(String),

    /// Release record storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Template rendering error
    #[error("template error: {0}")]
    Render(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compression error
    #[error("compression error: {0}")]
    Compression(String),

    /// Defect: a state that should be unreachable
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    /// Release missing, or a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        match self {
            KubeError::ReleaseNotFound { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Authentication or authorization failure
    pub fn is_auth_error(&self) -> bool {
        let by_status = matches!(
            self,
            KubeError::Api(kube::Error::Api(resp)) if resp.code == 401 || resp.code == 403
        );
        let by_kind = matches!(self, KubeError::Api(kube::Error::Auth(_)));
        by_status || by_kind || mentions_auth_failure(&self.to_string())
    }

    /// Mistakes detectable locally, before any network call
    pub fn is_configuration(&self) -> bool {
        match self {
            KubeError::InvalidImportId { .. } | KubeError::ImmutableField { .. } => true,
            KubeError::Core(e) => e.is_configuration(),
            KubeError::Resolution(e) => e.is_configuration(),
            _ => false,
        }
    }
}

/// Whether free-form error text reads like a credential problem
pub fn mentions_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["unauthorized", "token expired", "credentials"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> KubeError {
        KubeError::Api(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_not_found() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(
            KubeError::ReleaseNotFound {
                name: "web".into(),
                namespace: "default".into()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_missing_release_does_not_read_as_missing_namespace() {
        let err = KubeError::ReleaseNotFound {
            name: "web".into(),
            namespace: "apps".into(),
        };
        assert_eq!(crate::diagnostics::classify(&err.to_string()), crate::diagnostics::Category::Unknown);
    }

    #[test]
    fn test_auth_error_by_status_and_message() {
        assert!(api_error(401).is_auth_error());
        assert!(api_error(403).is_auth_error());
        assert!(!api_error(500).is_auth_error());
        assert!(KubeError::Config("Unauthorized".into()).is_auth_error());
        assert!(KubeError::Storage("exec plugin: token expired".into()).is_auth_error());
        assert!(!KubeError::Storage("connection refused".into()).is_auth_error());
    }

    #[test]
    fn test_configuration_errors() {
        let err = KubeError::InvalidImportId {
            id: "x".into(),
            reason: "too short".into(),
        };
        assert!(err.is_configuration());
        assert!(KubeError::from(RepoError::MissingRepository { chart: "x".into() }).is_configuration());
        assert!(!api_error(500).is_configuration());
    }
}
