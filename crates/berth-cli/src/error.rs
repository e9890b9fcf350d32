//! CLI error types with exit code handling
//!
//! Library errors are sorted into the categories an operator acts on
//! differently, each with its own exit code.

use berth_kube::KubeError;
use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// Invalid spec, overrides or identifiers; nothing was sent to the cluster
    #[error("Configuration error: {message}")]
    #[diagnostic(code(berth::cli::config))]
    Config {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// The chart could not be resolved
    #[error("{message}")]
    #[diagnostic(code(berth::cli::resolution))]
    Resolution {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Install, upgrade or uninstall failed; `detail` carries the guidance
    #[error("{title}")]
    #[diagnostic(code(berth::cli::operation))]
    Operation {
        title: String,
        #[help]
        detail: String,
    },

    /// Credentials rejected by the cluster
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(berth::cli::auth),
        help("Check the kubeconfig context and refresh its credentials")
    )]
    Auth { message: String },

    /// State file missing where a tracked release is required
    #[error("No tracked release in {path}")]
    #[diagnostic(
        code(berth::cli::state),
        help("Run `berth apply <spec.yaml>` or `berth import <ID>` first")
    )]
    NotTracked { path: String },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(berth::cli::io))]
    Io { message: String },

    /// Anything else
    #[error("{message}")]
    #[diagnostic(code(berth::cli::error))]
    Other { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::Resolution { .. } => exit_codes::RESOLUTION_ERROR,
            CliError::Operation { .. } => exit_codes::OPERATION_ERROR,
            CliError::Auth { .. } => exit_codes::AUTH_ERROR,
            CliError::NotTracked { .. } | CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Other { .. } => exit_codes::ERROR,
        }
    }

    /// Create a configuration error with help text
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// IO error naming the file involved
    pub fn io_at(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{}: {}", path.display(), err),
        }
    }

    pub fn not_tracked(path: &Path) -> Self {
        Self::NotTracked {
            path: path.display().to_string(),
        }
    }
}

impl From<KubeError> for CliError {
    fn from(err: KubeError) -> Self {
        if err.is_configuration() {
            let help = match &err {
                KubeError::ImmutableField { .. } => {
                    Some("Destroy the release and apply the new spec to replace it".to_string())
                }
                _ => None,
            };
            return CliError::Config {
                message: err.to_string(),
                help,
            };
        }

        match err {
            KubeError::Operation { title, detail } => CliError::Operation { title, detail },
            KubeError::Resolution(e) => CliError::Resolution {
                message: format!("Failed to resolve chart: {}", e),
                help: Some("Check the chart reference, repository URL and version".to_string()),
            },
            KubeError::Core(e) => CliError::Resolution {
                message: e.to_string(),
                help: None,
            },
            other if other.is_auth_error() => CliError::Auth {
                message: other.to_string(),
            },
            other => CliError::Other {
                message: other.to_string(),
            },
        }
    }
}

impl From<berth_core::CoreError> for CliError {
    fn from(err: berth_core::CoreError) -> Self {
        if err.is_configuration() {
            CliError::Config {
                message: err.to_string(),
                help: None,
            }
        } else {
            CliError::Other {
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Other {
            message: format!("state file is not valid JSON: {}", err),
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_map_to_config_exit_code() {
        let err: CliError = KubeError::InvalidImportId {
            id: "web".to_string(),
            reason: "missing release name".to_string(),
        }
        .into();
        assert!(matches!(err, CliError::Config { .. }));
        assert_eq!(err.exit_code(), exit_codes::CONFIG_ERROR);
    }

    #[test]
    fn test_immutable_field_suggests_replacement() {
        let err: CliError = KubeError::ImmutableField {
            field: "namespace".to_string(),
            from: "apps".to_string(),
            to: "web".to_string(),
        }
        .into();
        match err {
            CliError::Config { help: Some(help), .. } => assert!(help.contains("Destroy")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_operation_keeps_title_and_detail() {
        let err: CliError = KubeError::Operation {
            title: "install of release \"web\" timed out after 5m0s".to_string(),
            detail: "Suggestions:\n  - Increase timeout".to_string(),
        }
        .into();
        assert_eq!(err.exit_code(), exit_codes::OPERATION_ERROR);
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_auth_by_message() {
        let err: CliError = KubeError::Storage("Unauthorized".to_string()).into();
        assert_eq!(err.exit_code(), exit_codes::AUTH_ERROR);
    }
}
