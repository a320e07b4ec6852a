//! Activation identity.
//!
//! An activation is one (project, environment, isolation key) instantiation
//! of a project. It is the unit of build, render and deploy, and the key of
//! every memoization table in a pipeline invocation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Environment used when a dependency does not name one
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Isolation key used when a dependency does not name one
pub const DEFAULT_ISOLATION: &str = "a";

/// Identity of one activation: `(project, environment, isolation)`
///
/// Two activations are the same graph node iff their identities are equal,
/// regardless of how they were reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationId {
    /// Project name (the descriptor's `projectName`/`dnsName`)
    pub project: String,

    /// Environment name
    pub environment: String,

    /// Isolation key
    pub isolation: String,
}

impl ActivationId {
    pub fn new(
        project: impl Into<String>,
        environment: impl Into<String>,
        isolation: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
            isolation: isolation.into(),
        }
    }

    /// Dash-joined form, used for namespace names
    pub fn dashed(&self) -> String {
        format!("{}-{}-{}", self.project, self.environment, self.isolation)
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.environment, self.isolation)
    }
}

/// Render an ancestor path as `a.default.a > b.default.a`
pub fn path_to_string<'a>(path: impl IntoIterator<Item = &'a ActivationId>) -> String {
    path.into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" > ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_dashed() {
        let id = ActivationId::new("root", "test", "a");
        assert_eq!(id.to_string(), "root.test.a");
        assert_eq!(id.dashed(), "root-test-a");
    }

    #[test]
    fn test_value_equality() {
        let a = ActivationId::new("dep2", "foo", "a");
        let b = ActivationId::new("dep2", "foo", "b");
        assert_ne!(a, b);
        assert_eq!(a, ActivationId::new("dep2", "foo", "a"));
    }

    #[test]
    fn test_path_to_string() {
        let path = [
            ActivationId::new("root", "test", "a"),
            ActivationId::new("dep1", "default", "a"),
        ];
        assert_eq!(path_to_string(&path), "root.test.a > dep1.default.a");
    }
}
