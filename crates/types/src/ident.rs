// Path: crates/types/src/ident.rs

//! Minion identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unique identity of a minion.
///
/// A UTF-8 string, unique across the deployment and immutable once the
/// minion's key has been accepted. Used as the key of the PKI store, the
/// publish-channel subscription tag, and the `id` field of every return.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinionId(String);

impl MinionId {
    /// Wraps a raw identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the identity is usable as a single path component.
    ///
    /// The PKI store and the job cache both persist per-minion files named
    /// after the identity, so separators and relative components are refused
    /// at enrolment time.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && !self.0.contains(['/', '\\', '\0'])
    }
}

impl fmt::Display for MinionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MinionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MinionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_safety() {
        assert!(MinionId::new("web-01.example.com").is_path_safe());
        assert!(!MinionId::new("../escape").is_path_safe());
        assert!(!MinionId::new("a/b").is_path_safe());
        assert!(!MinionId::new("").is_path_safe());
    }
}
