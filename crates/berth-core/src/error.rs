//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Chart not found: {path}")]
    ChartNotFound { path: String },

    #[error("Invalid chart: {message}")]
    InvalidChart { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Invalid values document: {message}")]
    ValuesParse { message: String },

    #[error("Cannot set '{key}': segment '{segment}' already holds a non-map value")]
    KeyConflict { key: String, segment: String },

    #[error("Invalid override: {message}")]
    InvalidOverride { message: String },

    #[error("Archive error: {message}")]
    Archive { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl CoreError {
    /// Whether the error stems from user configuration rather than I/O
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ValuesParse { .. }
                | Self::KeyConflict { .. }
                | Self::InvalidOverride { .. }
                | Self::MissingField { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
