//! Wrapper for values that must never reach logs

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value whose `Debug` and `Display` output is redacted
///
/// Serialization is transparent: the persisted state keeps the real value,
/// only diagnostic output hides it.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the wrapped value
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Sensitive<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sensitive(***)")
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(sensitive value)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = Sensitive::new("hunter2".to_string());
        assert_eq!(format!("{:?}", secret), "Sensitive(***)");
        assert!(!format!("{}", secret).contains("hunter2"));
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_serde_is_transparent() {
        let secret = Sensitive::new("token".to_string());
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"token\"");

        let parsed: Sensitive<String> = serde_json::from_str("\"token\"").unwrap();
        assert_eq!(parsed, secret);
    }
}
