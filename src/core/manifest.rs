//! Manifest stage.
//!
//! Renders every activation's resource documents, stamps them with their
//! namespace and provenance, and runs the concatenated stream through the
//! post-processing plugins.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info, instrument};

use super::build::BuildOutcome;
use super::display::DisplayQueue;
use super::pipeline::{run_in_dependency_order, DependencyOutputs, NodeStage, StageContext};
use super::walker::ActivationNode;
use crate::adapters::OutputStream;
use crate::domain::resource::{annotations, dump_documents, parse_documents, ROOT_ACTIVATION_LABEL};
use crate::domain::{RenderError, Resource, Variables};

/// Rendered manifest of a whole activation graph
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Final document stream, after plugins
    pub yaml: String,

    /// Parsed form of `yaml`
    pub resources: Vec<Resource>,
}

struct ManifestStage {
    ctx: StageContext,
    builds: Arc<BuildOutcome>,
    extra_args: Vec<String>,
    queue: DisplayQueue,
}

impl ManifestStage {
    fn variables(&self, node: &ActivationNode) -> Variables {
        let mut vars = self
            .ctx
            .base_environment(node)
            .with_descriptor(&node.descriptor, &node.id.environment);

        if let Some(result) = self.builds.result_for(&node.id) {
            vars.insert("PELTON_BUILD_RESULT".to_string(), result.to_string());
        }

        let extra_args = if node.is_root() {
            serde_json::to_string(&self.extra_args).unwrap_or_else(|_| "[]".to_string())
        } else {
            "[]".to_string()
        };
        vars.insert("PELTON_EXTRA_ARGS".to_string(), extra_args);

        vars
    }
}

impl NodeStage for ManifestStage {
    type Output = Arc<Vec<Resource>>;

    fn process(
        &mut self,
        node: Arc<ActivationNode>,
        dependencies: DependencyOutputs<Arc<Vec<Resource>>>,
    ) -> BoxFuture<'static, Result<Arc<Vec<Resource>>>> {
        let env = match node.environment() {
            Ok(env) => env,
            Err(e) => return futures::future::ready(Err(e.into())).boxed(),
        };
        let namespace = self.ctx.base_environment(&node).project_namespace;

        // Manifest dependencies arrive already rendered
        if let Some(rendered) = env.rendered_manifest.clone() {
            return async move {
                dependencies.await?;
                stamp_all(&rendered, &node, &namespace).map(Arc::new)
            }
            .boxed();
        }

        let Some(render_command) = env.manifest_render_command.clone() else {
            debug!(activation = %node.id, "no manifest render command");
            return async move {
                dependencies.await?;
                Ok(Arc::new(Vec::new()))
            }
            .boxed();
        };

        let command = self
            .ctx
            .executor
            .command(self.variables(&node))
            .cd(node.directory.to_string_lossy())
            .and_then()
            .eval([render_command]);
        let mut turn = self.queue.enqueue();
        let console = self.ctx.console.clone();

        async move {
            dependencies.await?;
            let mut running = command.spawn();

            turn.wait().await;
            console
                .show_task(
                    &format!("Generating {} manifest...", node.id),
                    &mut running.output,
                    &[OutputStream::Stderr],
                )
                .await;

            let out = running
                .wait()
                .await
                .with_context(|| format!("Rendering the manifest of {} failed", node.id))?;
            drop(turn);

            let resources = stamp_all(&out.stdout, &node, &namespace)?;
            debug!(activation = %node.id, count = resources.len(), "done creating manifest");
            Ok(Arc::new(resources))
        }
        .boxed()
    }
}

/// Parse one activation's documents and stamp each with provenance
fn stamp_all(raw: &str, node: &ActivationNode, namespace: &str) -> Result<Vec<Resource>> {
    let mut resources = parse_documents(raw).map_err(|message| RenderError::Manifest {
        activation: node.id.to_string(),
        raw: raw.to_string(),
        message,
    })?;

    let root = node.root().to_string();
    let dependencies = node
        .dependencies
        .iter()
        .map(|(id, _)| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let descriptor = serde_json::to_string(&*node.descriptor)
        .context("Failed to serialize project descriptor")?;
    let directory = node.directory.to_string_lossy();

    for resource in &mut resources {
        resource.set_namespace(namespace);
        resource.set_label(ROOT_ACTIVATION_LABEL, &root);

        resource.set_annotation(annotations::DEPENDENCY_ACTIVATION_IDS, &dependencies);
        resource.set_annotation(annotations::SOURCE_PROJECT_CONFIG, &descriptor);
        resource.set_annotation(annotations::SOURCE_ACTIVATION, &node.id.to_string());
        resource.set_annotation(annotations::SOURCE_ACTIVATION_DNS, &node.id.project);
        resource.set_annotation(
            annotations::SOURCE_ACTIVATION_ENVIRONMENT,
            &node.id.environment,
        );
        resource.set_annotation(annotations::SOURCE_ACTIVATION_ISOLATION, &node.id.isolation);
        resource.set_annotation(annotations::SOURCE_PROJECT_DIRECTORY, &directory);
        resource.set_annotation(annotations::ROOT_ACTIVATION, &root);
    }

    Ok(resources)
}

/// Render the manifest of the graph rooted at `directory`
///
/// `extra_args` are exported to the root's render command as a JSON array.
#[instrument(skip(ctx, directory, builds, plugins, extra_args), fields(directory = %directory.display()))]
pub async fn render_manifest(
    ctx: &StageContext,
    directory: &Path,
    environment: &str,
    isolation: &str,
    builds: &BuildOutcome,
    plugins: &[String],
    extra_args: &[String],
) -> Result<Manifest> {
    info!("Manifest step");

    let stage = ManifestStage {
        ctx: ctx.clone(),
        builds: Arc::new(builds.clone()),
        extra_args: extra_args.to_vec(),
        queue: DisplayQueue::new(),
    };
    let root_vars = stage.variables(&builds.root);

    let run = run_in_dependency_order(&ctx.executor, directory, environment, isolation, stage)
        .await?;

    // Display order is post-order, so concatenate the same way
    let mut resources = Vec::new();
    for id in &run.graph.post_order {
        if let Some(rendered) = run.outputs.get(id) {
            resources.extend(rendered.iter().cloned());
        }
    }

    let mut yaml = dump_documents(&resources).context("Failed to serialize the manifest")?;
    for plugin in plugins {
        let mut running = ctx
            .executor
            .command(root_vars.clone())
            .echo([yaml.as_str()])
            .pipe()
            .eval([plugin.as_str()])
            .spawn();
        ctx.console
            .show_task(
                &format!("Plugin \"{}\"...", plugin),
                &mut running.output,
                &[OutputStream::Stderr],
            )
            .await;

        let out = running
            .wait()
            .await
            .with_context(|| format!("Plugin \"{}\" failed", plugin))?;

        resources = parse_documents(&out.stdout).map_err(|message| RenderError::Plugin {
            plugin: plugin.clone(),
            raw: out.stdout.clone(),
            message,
        })?;
        yaml = out.stdout;
    }

    Ok(Manifest { yaml, resources })
}
