//! Import identifiers: `context:release` or `context:namespace:release`

use std::fmt;
use std::str::FromStr;

use crate::error::KubeError;

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportId {
    pub context: String,
    pub namespace: String,
    pub name: String,
}

impl FromStr for ImportId {
    type Err = KubeError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| KubeError::InvalidImportId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = id.split(':').collect();
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("every part must be non-empty"));
        }

        match parts.as_slice() {
            [context, name] => Ok(Self {
                context: context.to_string(),
                namespace: DEFAULT_NAMESPACE.to_string(),
                name: name.to_string(),
            }),
            [context, namespace, name] => Ok(Self {
                context: context.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            [_] => Err(invalid("missing release name")),
            _ => Err(invalid("too many parts")),
        }
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.context, self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_parts_default_namespace() {
        let id: ImportId = "prod:web".parse().unwrap();
        assert_eq!(id.context, "prod");
        assert_eq!(id.namespace, "default");
        assert_eq!(id.name, "web");
    }

    #[test]
    fn test_three_parts() {
        let id: ImportId = "prod:apps:web".parse().unwrap();
        assert_eq!(id.namespace, "apps");
        assert_eq!(id.to_string(), "prod:apps:web");
    }

    #[test]
    fn test_invalid_ids() {
        for id in ["", "web", "prod:", ":web", "prod::web", "a:b:c:d"] {
            let err = id.parse::<ImportId>().unwrap_err();
            assert!(matches!(err, KubeError::InvalidImportId { .. }), "{}", id);
            assert!(err.is_configuration());
        }
    }
}
