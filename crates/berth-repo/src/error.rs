//! Error types for chart acquisition

use berth_core::CoreError;
use thiserror::Error;

/// Chart acquisition errors
#[derive(Debug, Error)]
pub enum RepoError {
    // ============ Configuration Errors ============
    #[error("Chart '{chart}' is not a local path, so a repository URL is required")]
    MissingRepository { chart: String },

    #[error("OCI chart '{reference}' requires an explicit version")]
    MissingVersion { reference: String },

    #[error("Invalid repository URL: {url} - {reason}")]
    InvalidRepositoryUrl { url: String, reason: String },

    #[error("Invalid version constraint '{constraint}': {reason}")]
    InvalidConstraint { constraint: String, reason: String },

    #[error("TLS configuration error: {message}")]
    Tls { message: String },

    // ============ Network Errors ============
    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Request timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Rate limited by server. Retry after {retry_after} seconds")]
    RateLimited { retry_after: u64 },

    // ============ Authentication Errors ============
    #[error("Authentication required for {url}")]
    AuthRequired { url: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    // ============ Index Errors ============
    #[error("Index not found at {url}")]
    IndexNotFound { url: String },

    #[error("Index parse error: {message}")]
    IndexParseError { message: String },

    // ============ Chart Errors ============
    #[error("Chart not found: {name} in repository {repo}")]
    ChartNotFound { name: String, repo: String },

    #[error("No version of {name} satisfies {constraint} (available: {available})")]
    UnsatisfiableConstraint {
        name: String,
        constraint: String,
        available: String,
    },

    #[error("Integrity check failed for {name}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Failed to load chart: {0}")]
    Chart(#[from] CoreError),

    #[error("Dependency {name} could not be fetched: {message}")]
    DependencyFailed { name: String, message: String },

    // ============ OCI Errors ============
    #[error("OCI registry error: {message}")]
    OciError { message: String },

    #[error("Invalid OCI reference: {reference}")]
    InvalidOciReference { reference: String },

    #[error("missing registry client: cannot pull {reference}")]
    MissingRegistryClient { reference: String },

    // ============ IO Errors ============
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RepoError {
    /// Configuration mistakes detectable before any network call
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::MissingRepository { .. }
            | Self::MissingVersion { .. }
            | Self::InvalidRepositoryUrl { .. }
            | Self::InvalidConstraint { .. }
            | Self::InvalidOciReference { .. }
            | Self::Tls { .. } => true,
            Self::Chart(e) => e.is_configuration(),
            _ => false,
        }
    }
}

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

impl From<reqwest::Error> for RepoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RepoError::Timeout { seconds: 30 }
        } else if e.is_connect() {
            RepoError::NetworkError {
                message: format!("Connection failed: {}", e),
            }
        } else if let Some(status) = e.status() {
            RepoError::HttpError {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            RepoError::NetworkError {
                message: e.to_string(),
            }
        }
    }
}

impl From<serde_yaml::Error> for RepoError {
    fn from(e: serde_yaml::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for RepoError {
    fn from(e: url::ParseError) -> Self {
        RepoError::InvalidRepositoryUrl {
            url: String::new(),
            reason: e.to_string(),
        }
    }
}
