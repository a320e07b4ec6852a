//! Deploy/start engine.
//!
//! Applies a rendered manifest namespace by namespace, pruning whatever the
//! root activation deployed before and no longer renders. Unless detached,
//! it then waits for the root's pods, multiplexes their logs, and on the
//! first interrupt deletes the root's own resources:
//!
//! ```text
//! Watching --interrupt--> Pausing --> TearingDown --teardown done--> Done
//!     any state but Watching --interrupt--> forced exit
//! ```
//!
//! Log lines arriving while paused or tearing down are buffered and flushed
//! once the teardown finishes. The log followers are then stopped, whatever
//! they already delivered is printed, and the engine returns.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use futures::future::{try_join_all, BoxFuture, Fuse, FusedFuture, FutureExt};
use tokio::sync::mpsc::{self, Receiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::command::{CommandBuilder, Executor, RunningCommand};
use super::display::Console;
use super::pipeline::StageContext;
use super::walker::ActivationNode;
use crate::adapters::OutputStream;
use crate::domain::resource::{annotations, dump_documents, ROOT_ACTIVATION_LABEL};
use crate::domain::{Resource, Variables};

/// Namespaced kinds pruned by apply
pub const PRUNE_ALLOWLIST: &[&str] = &[
    "core/v1/ConfigMap",
    "core/v1/Endpoints",
    "core/v1/PersistentVolumeClaim",
    "core/v1/Pod",
    "core/v1/ReplicationController",
    "core/v1/Secret",
    "core/v1/Service",
    "batch/v1/Job",
    "batch/v1/CronJob",
    "networking.k8s.io/v1/Ingress",
    "apps/v1/DaemonSet",
    "apps/v1/Deployment",
    "apps/v1/ReplicaSet",
    "apps/v1/StatefulSet",
];

/// Namespace of resources that do not name one
pub const DEFAULT_NAMESPACE: &str = "default";

const STARTED_PODS: &str = "status.phase!=Pending,status.phase!=Unknown";
const RUNNING_PODS: &str = "status.phase=Running";

/// ANSI colours cycled through per pod and stream
const POD_COLORS: [u8; 7] = [34, 35, 32, 36, 33, 37, 31];

/// How the engine ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Applied and returned without watching
    Detached,

    /// Root resources were deleted after an interrupt or because there were
    /// no pods to watch
    TornDown,

    /// Every followed log stream ended on its own
    LogsEnded,

    /// A second interrupt arrived before teardown finished
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Watching,
    Pausing,
    TearingDown,
    Done,
}

/// One line of a followed pod log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Position of the pod in the followed set, for colouring
    pub index: usize,
    pub pod: String,
    pub stream: OutputStream,
    pub text: String,
}

/// Formats log lines, omitting a header equal to the previous one
#[derive(Debug, Default)]
pub struct LogFormatter {
    last_header: Option<String>,
}

impl LogFormatter {
    pub fn format(&mut self, line: &LogLine) -> String {
        let (label, offset) = match line.stream {
            OutputStream::Stdout => ("out", 0),
            OutputStream::Stderr => ("err", 1),
        };
        let header = format!("{} {}> ", line.pod, label);
        let color = POD_COLORS[(line.index * 2 + offset) % POD_COLORS.len()];
        let text = line.text.strip_suffix('\n').unwrap_or(&line.text);

        let shown = if self.last_header.as_deref() == Some(header.as_str()) {
            ""
        } else {
            header.as_str()
        };
        let formatted = format!("\x1b[{}m{}{}\x1b[0m", color, shown, text);

        self.last_header = Some(header);
        formatted
    }
}

/// Group resources by namespace, filling in the default namespace
pub fn group_by_namespace(resources: &[Resource]) -> BTreeMap<String, Vec<Resource>> {
    let mut groups: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
    for resource in resources {
        let mut resource = resource.clone();
        let namespace = resource.namespace().unwrap_or(DEFAULT_NAMESPACE).to_string();
        resource.set_namespace(&namespace);
        groups.entry(namespace).or_default().push(resource);
    }
    groups
}

/// `kind/name` of every resource rendered by `root` itself
pub fn root_resources(resources: &[Resource], root: &ActivationNode) -> Vec<String> {
    let root_id = root.id.to_string();
    resources
        .iter()
        .filter(|r| r.annotation(annotations::SOURCE_ACTIVATION) == Some(root_id.as_str()))
        .filter_map(Resource::reference)
        .collect()
}

/// Applies manifests and watches the root's pods
pub struct DeployEngine {
    ctx: StageContext,
}

impl DeployEngine {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    fn command(&self) -> CommandBuilder {
        self.ctx.executor.command(Variables::new())
    }

    /// Deploy `resources` for `root`
    ///
    /// `interrupts` delivers one message per interrupt signal.
    #[instrument(skip_all, fields(root = %root.id))]
    pub async fn run(
        &self,
        root: &ActivationNode,
        resources: &[Resource],
        detach: bool,
        mut interrupts: Receiver<()>,
    ) -> Result<Shutdown> {
        info!("Start step");
        let groups = group_by_namespace(resources);

        self.ensure_namespaces(groups.keys()).await?;
        for (namespace, group) in &groups {
            self.apply(root, namespace, group).await?;
        }

        if detach {
            return Ok(Shutdown::Detached);
        }

        let teardown_refs = root_resources(resources, root);
        let selector_command = root.environment()?.pod_selector_command.clone();
        let Some(selector_command) = selector_command else {
            debug!("no pod selector, nothing to watch");
            self.teardown(root, teardown_refs).await;
            return Ok(Shutdown::TornDown);
        };

        let selector = self.pod_selector(root, &selector_command).await?;
        self.announce_wait(&selector);

        loop {
            if !self.pods(STARTED_PODS, &selector).await?.is_empty() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.pod_poll_interval) => {}
                Some(()) = interrupts.recv() => {
                    return self.teardown_unless_forced(root, teardown_refs, &mut interrupts).await;
                }
            }
        }

        let pods = self.pods(RUNNING_PODS, &selector).await?;
        info!(pods = pods.len(), "following logs");
        let (tx, logs) = mpsc::unbounded_channel();
        let (stop, stopped) = watch::channel(false);
        for (index, pod) in pods.into_iter().enumerate() {
            self.follow(index, pod, tx.clone(), stopped.clone());
        }
        drop(tx);

        self.watch(root, teardown_refs, logs, interrupts, stop).await
    }

    async fn ensure_namespaces<'a>(
        &self,
        namespaces: impl Iterator<Item = &'a String>,
    ) -> Result<()> {
        let creations = namespaces
            .filter(|ns| ns.as_str() != DEFAULT_NAMESPACE)
            .map(|ns| {
                self.command()
                    .cluster_control(["get", "namespace", ns.as_str()])
                    .or_else()
                    .cluster_control(["create", "namespace", ns.as_str()])
                    .run()
            });

        try_join_all(creations)
            .await
            .context("Failed to create namespace")?;
        Ok(())
    }

    async fn apply(&self, root: &ActivationNode, namespace: &str, group: &[Resource]) -> Result<()> {
        let mut args = vec!["apply".to_string(), "--namespace".to_string(), namespace.to_string()];
        for kind in PRUNE_ALLOWLIST {
            args.push("--prune-allowlist".to_string());
            args.push(kind.to_string());
        }
        args.extend([
            "--selector".to_string(),
            format!("{}={}", ROOT_ACTIVATION_LABEL, root.id),
            "--prune".to_string(),
            "-f".to_string(),
            "-".to_string(),
        ]);

        let documents = dump_documents(group).with_context(|| {
            format!("Failed to serialize the resources of namespace {}", namespace)
        })?;
        let mut running = self
            .command()
            .echo([documents])
            .pipe()
            .cluster_control(args)
            .spawn();
        self.ctx
            .console
            .show_task(
                &format!("Starting namespace {} for {}...", namespace, root.id),
                &mut running.output,
                &[OutputStream::Stdout, OutputStream::Stderr],
            )
            .await;

        running
            .wait()
            .await
            .with_context(|| format!("Failed to apply namespace {}", namespace))?;
        Ok(())
    }

    async fn pod_selector(&self, root: &ActivationNode, command: &str) -> Result<String> {
        let vars = self
            .ctx
            .base_environment(root)
            .with_descriptor(&root.descriptor, &root.id.environment);
        let out = self
            .ctx
            .executor
            .command(vars)
            .eval(["echo", command])
            .run()
            .await
            .context("Failed to evaluate pod selector")?;
        Ok(out.stdout.trim().to_string())
    }

    fn announce_wait(&self, selector: &str) {
        let console = &self.ctx.console;
        console.line("Waiting for at least one pod...");
        console.line("");
        console.line(&format!(
            "    {} get pods \\\n        --namespace {} \\\n        --field-selector {} \\\n        --selector {}",
            self.ctx.executor.cluster_control_name(),
            self.ctx.target_namespace,
            STARTED_PODS,
            selector
        ));
        console.line("");
    }

    async fn pods(&self, field_selector: &str, selector: &str) -> Result<Vec<String>> {
        let out = self
            .command()
            .cluster_control([
                "get",
                "pods",
                "--namespace",
                self.ctx.target_namespace.as_str(),
                "--field-selector",
                field_selector,
                "--selector",
                selector,
                "-o",
                "jsonpath={.items[*].metadata.name}",
            ])
            .run()
            .await
            .context("Failed to query pods")?;

        Ok(out.stdout.split_whitespace().map(str::to_string).collect())
    }

    /// Follow one pod's logs in the background until the stream ends or
    /// `stop` changes
    fn follow(
        &self,
        index: usize,
        pod: String,
        lines: UnboundedSender<LogLine>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut running = self
            .command()
            .cluster_control([
                "logs",
                "--namespace",
                self.ctx.target_namespace.as_str(),
                "--follow",
                pod.as_str(),
            ])
            .ignoring_interrupts()
            .spawn();

        tokio::spawn(async move {
            loop {
                let listening = tokio::select! {
                    chunk = running.output.recv() => match chunk {
                        Some(chunk) => forward(&lines, index, &pod, chunk.stream, &chunk.text),
                        None => break,
                    },
                    _ = stop.changed() => false,
                };
                if !listening {
                    debug!(pod = %pod, "stopping log stream");
                    running.stop().await;
                    return;
                }
            }
            finish_stream(running, &pod).await;
        });
    }

    /// Multiplex logs until they end or an interrupt tears the root down
    async fn watch(
        &self,
        root: &ActivationNode,
        teardown_refs: Vec<String>,
        mut logs: mpsc::UnboundedReceiver<LogLine>,
        mut interrupts: Receiver<()>,
        stop: watch::Sender<bool>,
    ) -> Result<Shutdown> {
        let mut state = WatchState::Watching;
        let mut formatter = LogFormatter::default();
        let mut paused: Vec<String> = Vec::new();
        let mut teardown: Fuse<BoxFuture<'static, ()>> = Fuse::terminated();
        let mut teardown_refs = Some(teardown_refs);
        let mut logs_open = true;
        let mut interrupts_open = true;

        loop {
            match state {
                WatchState::Done => {
                    stop.send_replace(true);
                    // Followers drop their senders once stopped
                    while let Some(line) = logs.recv().await {
                        self.ctx.console.line(&formatter.format(&line));
                    }
                    return Ok(Shutdown::TornDown);
                }
                WatchState::Watching if !logs_open => return Ok(Shutdown::LogsEnded),
                WatchState::Pausing => {
                    let refs = teardown_refs.take().unwrap_or_default();
                    teardown = teardown_task(
                        self.ctx.executor.clone(),
                        self.ctx.console.clone(),
                        root.id.to_string(),
                        self.ctx.target_namespace.clone(),
                        refs,
                    )
                    .fuse();
                    state = WatchState::TearingDown;
                }
                _ => {}
            }

            tokio::select! {
                line = logs.recv(), if logs_open => match line {
                    Some(line) => {
                        let text = formatter.format(&line);
                        if state == WatchState::TearingDown {
                            paused.push(text);
                        } else {
                            self.ctx.console.line(&text);
                        }
                    }
                    None => logs_open = false,
                },

                signal = interrupts.recv(), if interrupts_open => match signal {
                    Some(()) if state == WatchState::Watching => {
                        info!("interrupt received, stopping {}", root.id);
                        state = WatchState::Pausing;
                    }
                    Some(()) => return Ok(Shutdown::Forced),
                    None => interrupts_open = false,
                },

                _ = &mut teardown, if !teardown.is_terminated() => {
                    for text in paused.drain(..) {
                        self.ctx.console.line(&text);
                    }
                    state = WatchState::Done;
                }

                else => return Ok(Shutdown::LogsEnded),
            }
        }
    }

    async fn teardown(&self, root: &ActivationNode, refs: Vec<String>) {
        teardown_task(
            self.ctx.executor.clone(),
            self.ctx.console.clone(),
            root.id.to_string(),
            self.ctx.target_namespace.clone(),
            refs,
        )
        .await
    }

    async fn teardown_unless_forced(
        &self,
        root: &ActivationNode,
        refs: Vec<String>,
        interrupts: &mut Receiver<()>,
    ) -> Result<Shutdown> {
        tokio::select! {
            _ = self.teardown(root, refs) => Ok(Shutdown::TornDown),
            Some(()) = interrupts.recv() => Ok(Shutdown::Forced),
        }
    }
}

/// Send each line of `text` to the watcher; false once it stopped listening
fn forward(
    lines: &UnboundedSender<LogLine>,
    index: usize,
    pod: &str,
    stream: OutputStream,
    text: &str,
) -> bool {
    text.split_inclusive('\n').all(|text| {
        lines
            .send(LogLine {
                index,
                pod: pod.to_string(),
                stream,
                text: text.to_string(),
            })
            .is_ok()
    })
}

async fn finish_stream(running: RunningCommand, pod: &str) {
    if let Err(e) = running.wait().await {
        warn!(pod = %pod, error = %e, "log stream ended with an error");
    }
}

/// Delete the root's own resources; failures are reported, not returned
fn teardown_task(
    executor: Executor,
    console: Console,
    root: String,
    namespace: String,
    refs: Vec<String>,
) -> BoxFuture<'static, ()> {
    async move {
        if refs.is_empty() {
            debug!("no root resources to delete");
            return;
        }

        let mut args = vec!["delete".to_string(), "-n".to_string(), namespace];
        args.extend(refs);
        let mut running = executor.command(Variables::new()).cluster_control(args).spawn();

        console
            .show_task(
                &format!("Stopping {}...", root),
                &mut running.output,
                &[OutputStream::Stdout, OutputStream::Stderr],
            )
            .await;
        if let Err(e) = running.wait().await {
            warn!(error = %e, "teardown failed");
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::resource::parse_documents;

    fn line(index: usize, pod: &str, stream: OutputStream, text: &str) -> LogLine {
        LogLine {
            index,
            pod: pod.to_string(),
            stream,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_log_headers_are_deduplicated() {
        let mut formatter = LogFormatter::default();

        let first = formatter.format(&line(0, "web-1", OutputStream::Stdout, "hello\n"));
        let second = formatter.format(&line(0, "web-1", OutputStream::Stdout, "again\n"));
        let third = formatter.format(&line(0, "web-1", OutputStream::Stderr, "oops\n"));
        let fourth = formatter.format(&line(1, "web-2", OutputStream::Stdout, "hi\n"));

        assert_eq!(first, "\x1b[34mweb-1 out> hello\x1b[0m");
        assert_eq!(second, "\x1b[34magain\x1b[0m");
        assert_eq!(third, "\x1b[35mweb-1 err> oops\x1b[0m");
        assert_eq!(fourth, "\x1b[32mweb-2 out> hi\x1b[0m");
    }

    #[test]
    fn test_grouping_fills_default_namespace() {
        let resources = parse_documents(
            "kind: ConfigMap\nmetadata:\n  name: a\n---\nkind: ConfigMap\nmetadata:\n  name: b\n  namespace: pltn-x\n",
        )
        .unwrap();

        let groups = group_by_namespace(&resources);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["default", "pltn-x"]);
        assert_eq!(groups["default"][0].namespace(), Some("default"));
    }
}
