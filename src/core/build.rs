//! Build stage.
//!
//! Runs every activation's build command once its dependencies are built.
//! Builds of independent activations run concurrently; their progress windows are
//! shown one at a time in dependency order. The trimmed tail of each
//! build's stdout becomes that activation's build result.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info, instrument};

use super::display::DisplayQueue;
use super::pipeline::{run_in_dependency_order, DependencyOutputs, NodeStage, StageContext};
use super::walker::{ActivationGraph, ActivationNode};
use crate::adapters::OutputStream;
use crate::domain::ActivationId;

/// Build results keyed by activation string (`name.env.iso`)
pub type BuildResults = BTreeMap<String, String>;

/// Everything later stages need from the build
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub results: BuildResults,
    pub root: Arc<ActivationNode>,
    pub graph: ActivationGraph,
}

impl BuildOutcome {
    pub fn result_for(&self, id: &ActivationId) -> Option<&str> {
        self.results.get(&id.to_string()).map(String::as_str)
    }
}

struct BuildStage {
    ctx: StageContext,
    queue: DisplayQueue,
}

impl NodeStage for BuildStage {
    type Output = Option<String>;

    fn process(
        &mut self,
        node: Arc<ActivationNode>,
        dependencies: DependencyOutputs<Option<String>>,
    ) -> BoxFuture<'static, Result<Option<String>>> {
        let build_command = match node.environment() {
            Ok(env) => env.build_command.clone(),
            Err(e) => return futures::future::ready(Err(e.into())).boxed(),
        };
        let Some(build_command) = build_command else {
            debug!(activation = %node.id, "no build command");
            return async move {
                dependencies.await?;
                Ok(None)
            }
            .boxed();
        };

        let vars = self
            .ctx
            .base_environment(&node)
            .with_descriptor(&node.descriptor, &node.id.environment);
        let command = self
            .ctx
            .executor
            .command(vars)
            .cd(node.directory.to_string_lossy())
            .and_then()
            .eval([build_command]);
        let mut turn = self.queue.enqueue();
        let console = self.ctx.console.clone();
        let limit = self.ctx.config.build_result_limit;

        async move {
            dependencies.await?;
            let mut running = command.spawn();

            turn.wait().await;
            console
                .show_task(
                    &format!("Building {}...", node.id),
                    &mut running.output,
                    &[OutputStream::Stderr],
                )
                .await;

            let out = running
                .wait()
                .await
                .with_context(|| format!("Build of {} failed", node.id))?;
            drop(turn);

            debug!(activation = %node.id, "done building");
            Ok(Some(tail(out.stdout.trim(), limit)))
        }
        .boxed()
    }
}

/// Last `limit` characters of `text`
fn tail(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(limit)).collect()
}

/// Build the activation graph rooted at `directory`
#[instrument(skip(ctx, directory), fields(directory = %directory.display()))]
pub async fn build(
    ctx: &StageContext,
    directory: &Path,
    environment: &str,
    isolation: &str,
) -> Result<BuildOutcome> {
    info!("Build step");

    let stage = BuildStage {
        ctx: ctx.clone(),
        queue: DisplayQueue::new(),
    };
    let run = run_in_dependency_order(&ctx.executor, directory, environment, isolation, stage)
        .await?;

    let results = run
        .outputs
        .into_iter()
        .filter_map(|(id, result)| result.map(|r| (id.to_string(), r)))
        .collect();
    let root = run
        .graph
        .root_node()
        .cloned()
        .ok_or_else(|| anyhow!("Root activation {} was not resolved", run.graph.root))?;

    Ok(BuildOutcome {
        results,
        root,
        graph: run.graph,
    })
}
