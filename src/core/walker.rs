//! Dependency graph walker.
//!
//! Discovers the activation graph below a project directory by running each
//! dependency's discovery command, memoizing by [`ActivationId`] so every
//! activation is resolved once however many parents depend on it. Visitors
//! see each activation on the way down and, once all of its dependencies
//! are resolved, on the way back up (post-order).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, instrument};

use super::command::Executor;
use crate::adapters::normalize_path;
use crate::domain::activation::path_to_string;
use crate::domain::project::descriptor_path;
use crate::domain::{
    ActivationId, ConfigError, DependencySource, EnvironmentSpec, ProjectDescriptor,
};

/// A fully resolved activation
#[derive(Debug, Clone)]
pub struct ActivationNode {
    pub id: ActivationId,
    pub descriptor: Arc<ProjectDescriptor>,

    /// Direct dependencies, in declaration order
    pub dependencies: Vec<(ActivationId, Arc<ProjectDescriptor>)>,

    /// Ancestors from the root down to (excluding) this activation
    pub dependency_path: Vec<ActivationId>,

    pub directory: PathBuf,
}

impl ActivationNode {
    pub fn is_root(&self) -> bool {
        self.dependency_path.is_empty()
    }

    /// Root activation of the walk that reached this node
    pub fn root(&self) -> &ActivationId {
        self.dependency_path.first().unwrap_or(&self.id)
    }

    /// The activated environment of the descriptor
    pub fn environment(&self) -> Result<&EnvironmentSpec, ConfigError> {
        self.descriptor.environment(&self.id.environment)
    }

    /// File the descriptor was read from
    pub fn descriptor_file(&self) -> PathBuf {
        descriptor_path(&self.directory)
    }
}

/// Hooks invoked by the walker
#[async_trait]
pub trait ActivationVisitor: Send {
    /// Called once per activation, before its dependencies are discovered
    async fn on_enter(&mut self, _id: &ActivationId, _directory: &Path) -> Result<()> {
        Ok(())
    }

    /// Called once per activation, after all of its dependencies were left
    async fn on_leave(&mut self, _node: &Arc<ActivationNode>) -> Result<()> {
        Ok(())
    }
}

/// Visitor that does nothing, for plain graph discovery
pub struct NoopVisitor;

impl ActivationVisitor for NoopVisitor {}

/// Result of a complete walk
#[derive(Debug, Clone)]
pub struct ActivationGraph {
    pub root: ActivationId,
    pub nodes: HashMap<ActivationId, Arc<ActivationNode>>,

    /// Activations in the order they were left
    pub post_order: Vec<ActivationId>,
}

impl ActivationGraph {
    pub fn root_node(&self) -> Option<&Arc<ActivationNode>> {
        self.nodes.get(&self.root)
    }
}

enum Resolution {
    InProgress,
    Resolved(Arc<ActivationNode>),
}

/// Walk the graph rooted at `directory`/`environment`/`isolation`
#[instrument(skip(executor, directory, visitor), fields(directory = %directory.display()))]
pub async fn walk<V: ActivationVisitor>(
    executor: &Executor,
    directory: &Path,
    environment: &str,
    isolation: &str,
    visitor: &mut V,
) -> Result<ActivationGraph> {
    let mut walker = Walker {
        executor: executor.clone(),
        visitor,
        cache: HashMap::new(),
        post_order: Vec::new(),
    };

    let (root, _) = walker
        .walk_directory(
            directory.to_path_buf(),
            environment.to_string(),
            isolation.to_string(),
            Vec::new(),
        )
        .await?;

    let nodes = walker
        .cache
        .into_iter()
        .filter_map(|(id, resolution)| match resolution {
            Resolution::Resolved(node) => Some((id, node)),
            Resolution::InProgress => None,
        })
        .collect();

    Ok(ActivationGraph {
        root,
        nodes,
        post_order: walker.post_order,
    })
}

struct Walker<'v, V> {
    executor: Executor,
    visitor: &'v mut V,
    cache: HashMap<ActivationId, Resolution>,
    post_order: Vec<ActivationId>,
}

type Resolved = (ActivationId, Arc<ProjectDescriptor>);

impl<'v, V: ActivationVisitor> Walker<'v, V> {
    fn walk_directory(
        &mut self,
        directory: PathBuf,
        environment: String,
        isolation: String,
        path: Vec<ActivationId>,
    ) -> BoxFuture<'_, Result<Resolved>> {
        async move {
            let executor = self.executor.clone();
            let descriptor = Arc::new(read_descriptor(&executor, &directory).await?);
            self.visit(descriptor, directory, environment, isolation, path)
                .await
        }
        .boxed()
    }

    fn visit(
        &mut self,
        descriptor: Arc<ProjectDescriptor>,
        directory: PathBuf,
        environment: String,
        isolation: String,
        path: Vec<ActivationId>,
    ) -> BoxFuture<'_, Result<Resolved>> {
        async move {
            let id = descriptor.activation(&environment, &isolation);
            let file = descriptor_path(&directory);

            let mut chain = path.clone();
            chain.push(id.clone());

            if path.contains(&id) {
                return Err(ConfigError::new(format!(
                    "Dependency cycle: {}",
                    path_to_string(&chain)
                ))
                .with_parent(file, id)
                .into());
            }

            match self.cache.get(&id) {
                Some(Resolution::Resolved(node)) => {
                    debug!(
                        "## Skipping {} in {}. It was already activated above.",
                        path_to_string(&chain),
                        directory.display()
                    );
                    return Ok((id, node.descriptor.clone()));
                }
                Some(Resolution::InProgress) => {
                    return Err(ConfigError::new(format!(
                        "Activation {} is still being resolved: {}",
                        id,
                        path_to_string(&chain)
                    ))
                    .with_parent(file, id)
                    .into());
                }
                None => {}
            }

            debug!(
                "## Processing {} in {}",
                path_to_string(&chain),
                directory.display()
            );

            let result = self
                .resolve(id.clone(), descriptor.clone(), directory, path)
                .await;
            if let Err(e) = result {
                return Err(with_frame(e, file, id));
            }

            debug!("## Done processing {}", path_to_string(&chain));
            Ok((id, descriptor))
        }
        .boxed()
    }

    async fn resolve(
        &mut self,
        id: ActivationId,
        descriptor: Arc<ProjectDescriptor>,
        directory: PathBuf,
        path: Vec<ActivationId>,
    ) -> Result<()> {
        let env = descriptor.environment(&id.environment)?;

        self.cache.insert(id.clone(), Resolution::InProgress);
        self.visitor.on_enter(&id, &directory).await?;

        let variables = descriptor.variables_for(&id.environment);
        let mut child_path = path.clone();
        child_path.push(id.clone());

        let mut dependencies = Vec::with_capacity(env.dependencies.len());
        for (index, dependency) in env.dependencies.iter().enumerate() {
            let discovered = self
                .executor
                .command(variables.clone())
                .cd(directory.to_string_lossy())
                .and_then()
                .eval([dependency.source.command()])
                .run()
                .await
                .map_err(|e| {
                    ConfigError::new(format!(
                        "\"environments.{}.dependencies[{}].{}\" returned a non-zero exit code\n{}",
                        id.environment,
                        index,
                        dependency.source.key(),
                        e
                    ))
                })?;

            let resolved = match &dependency.source {
                DependencySource::PrintProjectDirectory(_) => {
                    let dir = normalize_path(&directory, discovered.stdout.trim());
                    self.walk_directory(
                        dir,
                        dependency.environment().to_string(),
                        dependency.isolation().to_string(),
                        child_path.clone(),
                    )
                    .await?
                }
                DependencySource::PrintProjectManifest(_) => {
                    let name = dependency.name.clone().unwrap_or_else(|| {
                        format!("{}-dependency-{}", descriptor.project_name, index)
                    });
                    let synthetic = ProjectDescriptor::synthetic(
                        &name,
                        dependency.environment(),
                        discovered.stdout,
                    );
                    self.visit(
                        Arc::new(synthetic),
                        directory.clone(),
                        dependency.environment().to_string(),
                        dependency.isolation().to_string(),
                        child_path.clone(),
                    )
                    .await?
                }
            };

            dependencies.push(resolved);
        }

        let node = Arc::new(ActivationNode {
            id: id.clone(),
            descriptor,
            dependencies,
            dependency_path: path,
            directory,
        });

        self.visitor.on_leave(&node).await?;
        self.cache.insert(id.clone(), Resolution::Resolved(node));
        self.post_order.push(id);

        Ok(())
    }
}

async fn read_descriptor(executor: &Executor, directory: &Path) -> Result<ProjectDescriptor> {
    let file = descriptor_path(directory);
    let content = executor.read_file(&file).await.map_err(|e| {
        ConfigError::new(format!("Could not read project descriptor: {:#}", e))
    })?;

    let descriptor = ProjectDescriptor::parse(&content, &file)?;
    if descriptor.project_name.is_empty() {
        return Err(ConfigError::new(format!(
            "{} does not define \"projectName\"",
            file.display()
        ))
        .into());
    }

    Ok(descriptor)
}

/// Append an ancestor frame to a configuration error
fn with_frame(error: anyhow::Error, file: PathBuf, id: ActivationId) -> anyhow::Error {
    match error.downcast::<ConfigError>() {
        Ok(config) => config.with_parent(file, id).into(),
        Err(other) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedBackend;

    fn project(name: &str, deps: &[&str]) -> String {
        let deps: Vec<String> = deps
            .iter()
            .map(|d| format!("      - printProjectDirectory: echo {}\n", d))
            .collect();
        format!(
            "projectName: {}\nenvironments:\n  default:\n    dependencies:\n{}",
            name,
            if deps.is_empty() {
                "      []\n".to_string()
            } else {
                deps.concat()
            }
        )
    }

    #[derive(Default)]
    struct Recorder {
        entered: Vec<String>,
        left: Vec<String>,
    }

    #[async_trait]
    impl ActivationVisitor for Recorder {
        async fn on_enter(&mut self, id: &ActivationId, _directory: &Path) -> Result<()> {
            self.entered.push(id.project.clone());
            Ok(())
        }

        async fn on_leave(&mut self, node: &Arc<ActivationNode>) -> Result<()> {
            self.left.push(node.id.project.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_post_order_and_memoization() {
        let backend = SimulatedBackend::new()
            .with_file("/app/pelton.yaml", project("app", &["../lib", "../db"]))
            .with_file("/lib/pelton.yaml", project("lib", &["../db"]))
            .with_file("/db/pelton.yaml", project("db", &[]));
        let executor = Executor::new(Arc::new(backend));
        let mut recorder = Recorder::default();

        let graph = walk(&executor, Path::new("/app"), "default", "a", &mut recorder)
            .await
            .unwrap();

        assert_eq!(recorder.entered, vec!["app", "lib", "db"]);
        assert_eq!(recorder.left, vec!["db", "lib", "app"]);
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.root, ActivationId::new("app", "default", "a"));

        let db = &graph.nodes[&ActivationId::new("db", "default", "a")];
        assert_eq!(db.directory, PathBuf::from("/db"));
        assert_eq!(db.root(), &graph.root);
    }

    #[tokio::test]
    async fn test_self_dependency_is_a_cycle() {
        let backend = SimulatedBackend::new().with_file("/app/pelton.yaml", project("app", &["."]));
        let executor = Executor::new(Arc::new(backend));

        let err = walk(&executor, Path::new("/app"), "default", "a", &mut NoopVisitor)
            .await
            .unwrap_err();
        let config = err.downcast_ref::<ConfigError>().unwrap();
        assert!(config.message.contains("app.default.a > app.default.a"));
    }
}
