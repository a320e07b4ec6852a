//! Staged pipeline driver.
//!
//! Runs a [`NodeStage`] over the activation graph in dependency order. Each
//! node is handed to the stage as soon as the walker leaves it, together
//! with a future of its dependencies' outputs; the stage's work is spawned
//! right away and waits on that future, so an activation starts as soon as
//! its own dependencies finish and never waits on unrelated subtrees.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tracing::{debug, instrument};

use super::command::Executor;
use super::display::Console;
use super::environment::BaseEnvironment;
use super::walker::{walk, ActivationGraph, ActivationNode, ActivationVisitor};
use crate::config::RunConfig;
use crate::domain::ActivationId;

/// Outputs of a node's dependencies, in declaration order, once they all
/// succeeded
pub type DependencyOutputs<T> = BoxFuture<'static, Result<Vec<T>>>;

/// Per-activation work of one pipeline stage
pub trait NodeStage: Send {
    type Output: Clone + Send + Sync + 'static;

    /// Start processing `node`
    ///
    /// Called synchronously in post-order, before the dependencies are
    /// necessarily done. Anything that must follow that order (e.g. display
    /// slots) is taken here; the returned future awaits `dependencies`
    /// before doing the node's own work.
    fn process(
        &mut self,
        node: Arc<ActivationNode>,
        dependencies: DependencyOutputs<Self::Output>,
    ) -> BoxFuture<'static, Result<Self::Output>>;
}

/// Collaborators shared by every stage of one invocation
#[derive(Debug, Clone)]
pub struct StageContext {
    pub executor: Executor,
    pub config: RunConfig,

    /// Where task windows and pod logs are shown
    pub console: Console,

    /// Namespace of the root activation's resources
    pub target_namespace: String,
}

impl StageContext {
    pub fn new(
        executor: Executor,
        config: RunConfig,
        console: Console,
        target_namespace: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            config,
            console,
            target_namespace: target_namespace.into(),
        }
    }

    /// Identity-derived environment of `node`
    pub fn base_environment(&self, node: &ActivationNode) -> BaseEnvironment {
        BaseEnvironment::new(&self.config, node.root(), &node.id, &self.target_namespace)
    }
}

/// A stage failure observed through a dependent
#[derive(Debug, Clone, Error)]
#[error("{0:#}")]
pub struct StageFailure(pub Arc<anyhow::Error>);

/// Outputs of a completed stage
#[derive(Debug, Clone)]
pub struct StageRun<T> {
    /// Output of the root activation, the last one processed
    pub root: T,

    /// Output of every activation
    pub outputs: HashMap<ActivationId, T>,

    pub graph: ActivationGraph,
}

type SharedOutput<T> = Shared<BoxFuture<'static, Result<T, Arc<anyhow::Error>>>>;

struct DependencyOrder<S: NodeStage> {
    stage: S,
    ongoing: HashMap<ActivationId, SharedOutput<S::Output>>,
    last: Option<SharedOutput<S::Output>>,
}

#[async_trait]
impl<S: NodeStage> ActivationVisitor for DependencyOrder<S> {
    async fn on_leave(&mut self, node: &Arc<ActivationNode>) -> Result<()> {
        let mut pending = Vec::with_capacity(node.dependencies.len());
        for (dependency, _) in &node.dependencies {
            let output = self.ongoing.get(dependency).cloned().ok_or_else(|| {
                anyhow!(
                    "{} reached before its dependency {} was processed",
                    node.id,
                    dependency
                )
            })?;
            pending.push(output);
        }

        let dependencies = async move {
            try_join_all(pending)
                .await
                .map_err(|e| anyhow::Error::from(StageFailure(e)))
        }
        .boxed();

        debug!(activation = %node.id, "processing");
        let task = tokio::spawn(self.stage.process(node.clone(), dependencies));
        let output = async move {
            match task.await {
                Ok(result) => result.map_err(Arc::new),
                Err(e) => Err(Arc::new(anyhow::Error::from(e))),
            }
        }
        .boxed()
        .shared();

        self.ongoing.insert(node.id.clone(), output.clone());
        self.last = Some(output);
        Ok(())
    }
}

/// Run `stage` over every activation reachable from the given root
#[instrument(skip(executor, directory, stage), fields(directory = %directory.display()))]
pub async fn run_in_dependency_order<S: NodeStage>(
    executor: &Executor,
    directory: &Path,
    environment: &str,
    isolation: &str,
    stage: S,
) -> Result<StageRun<S::Output>> {
    let mut visitor = DependencyOrder {
        stage,
        ongoing: HashMap::new(),
        last: None,
    };

    let graph = walk(executor, directory, environment, isolation, &mut visitor)
        .await
        .map_err(unshare)?;

    let last = visitor
        .last
        .ok_or_else(|| anyhow!("No activation was processed"))?;

    // The earliest failure in post-order is the one dependents report
    let mut outputs = HashMap::with_capacity(visitor.ongoing.len());
    for id in &graph.post_order {
        if let Some(output) = visitor.ongoing.get(id) {
            let output = output.clone().await.map_err(unwrap_shared)?;
            outputs.insert(id.clone(), output);
        }
    }
    let root = last.await.map_err(unwrap_shared)?;

    Ok(StageRun {
        root,
        outputs,
        graph,
    })
}

/// Recover the original error when no one else holds it
fn unwrap_shared(error: Arc<anyhow::Error>) -> anyhow::Error {
    match Arc::try_unwrap(error) {
        Ok(error) => error,
        Err(shared) => StageFailure(shared).into(),
    }
}

fn unshare(error: anyhow::Error) -> anyhow::Error {
    match error.downcast::<StageFailure>() {
        Ok(StageFailure(shared)) => unwrap_shared(shared),
        Err(other) => other,
    }
}
