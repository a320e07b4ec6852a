//! Identity-derived environment of stage subprocesses.

use crate::config::RunConfig;
use crate::domain::{ActivationId, ProjectDescriptor, Variables};

/// Namespaces and variables derived from an activation's place in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseEnvironment {
    /// Namespace the activation's resources go to
    pub project_namespace: String,

    /// Namespace shared by every dependency of the root
    pub dependency_namespace: String,

    pub variables: Variables,
}

impl BaseEnvironment {
    /// Environment of `source` when deploying `root` into `target_namespace`
    pub fn new(
        config: &RunConfig,
        root: &ActivationId,
        source: &ActivationId,
        target_namespace: &str,
    ) -> Self {
        let dependency_namespace = format!("{}{}", config.namespace_prefix, root.dashed());
        let project_namespace = if root == source {
            target_namespace.to_string()
        } else {
            dependency_namespace.clone()
        };

        let vars = [
            (
                "PELTON_DEPENDENCY_POD_DOMAIN",
                format!("{}.pod.cluster.local", dependency_namespace),
            ),
            (
                "PELTON_DEPENDENCY_SERVICE_DOMAIN",
                format!("{}.svc.cluster.local", dependency_namespace),
            ),
            ("PELTON_ENVIRONMENT", source.environment.clone()),
            ("PELTON_ISOLATION", source.isolation.clone()),
            (
                "PELTON_PROJECT_POD_DOMAIN",
                format!("{}.pod.cluster.local", project_namespace),
            ),
            (
                "PELTON_PROJECT_SERVICE_DOMAIN",
                format!("{}.svc.cluster.local", project_namespace),
            ),
            ("PELTON_ROOT_ACTIVATION", root.to_string()),
            ("PELTON_RUN", config.run_id.clone()),
            ("PELTON_SOURCE_ACTIVATION", source.to_string()),
        ];

        Self {
            project_namespace,
            dependency_namespace,
            variables: vars
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    /// Base variables overlaid with the descriptor's own
    pub fn with_descriptor(&self, descriptor: &ProjectDescriptor, environment: &str) -> Variables {
        let mut vars = self.variables.clone();
        vars.extend(descriptor.variables_for(environment));
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_goes_to_target_namespace() {
        let config = RunConfig::default().with_run_id("abc234");
        let root = ActivationId::new("root", "test", "a");

        let env = BaseEnvironment::new(&config, &root, &root, "default");
        assert_eq!(env.project_namespace, "default");
        assert_eq!(env.dependency_namespace, "pltn-root-test-a");
        assert_eq!(env.variables["PELTON_RUN"], "abc234");
        assert_eq!(
            env.variables["PELTON_PROJECT_SERVICE_DOMAIN"],
            "default.svc.cluster.local"
        );
    }

    #[test]
    fn test_dependency_shares_root_namespace() {
        let config = RunConfig::new("kubectl", "dev-");
        let root = ActivationId::new("root", "test", "a");
        let dep = ActivationId::new("dep2", "foo", "b");

        let env = BaseEnvironment::new(&config, &root, &dep, "default");
        assert_eq!(env.project_namespace, "dev-root-test-a");
        assert_eq!(env.variables["PELTON_SOURCE_ACTIVATION"], "dep2.foo.b");
        assert_eq!(env.variables["PELTON_ROOT_ACTIVATION"], "root.test.a");
        assert_eq!(env.variables["PELTON_ISOLATION"], "b");
    }

    #[test]
    fn test_descriptor_variables_win() {
        let config = RunConfig::default();
        let root = ActivationId::new("root", "default", "a");
        let descriptor = ProjectDescriptor {
            project_name: "root".to_string(),
            variables: [("PELTON_ENVIRONMENT".to_string(), "custom".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };

        let vars = BaseEnvironment::new(&config, &root, &root, "default")
            .with_descriptor(&descriptor, "default");
        assert_eq!(vars["PELTON_ENVIRONMENT"], "custom");
    }
}
