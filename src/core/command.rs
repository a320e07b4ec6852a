//! Command algebra.
//!
//! A command is an immutable expression tree of primitive leaves (`cd`,
//! `echo`, `eval`, cluster-control) joined by `&&`, `||` and `|`. Builders
//! alternate between "expects an action" ([`CommandBuilder`]) and "expects a
//! connective or run" ([`Command`]), so only well-formed expressions can be
//! built:
//!
//! ```ignore
//! executor.command(vars)
//!     .cd(dir).and_then().eval(["make image"])
//!     .run().await?;
//! ```
//!
//! Connectives are interpreted here, once, on top of a [`Backend`] that only
//! knows how to run single primitives. Pipe binds tighter than `&&`/`||`,
//! which associate to the left.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::adapters::{
    quote_arg, quote_args, Backend, ExecContext, LeafOutput, LiveOutput, OutputChunk,
    OutputStream, ShellBackend,
};
use crate::domain::Variables;

/// One primitive operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    Cd(String),
    Echo(Vec<String>),
    Eval(Vec<String>),
    ClusterControl(Vec<String>),
}

/// Composed command expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Leaf(Primitive),
    /// Run the right side only if the left side succeeded
    AndThen(Box<Expr>, Box<Expr>),
    /// Run the right side only if the left side failed
    OrElse(Box<Expr>, Box<Expr>),
    /// Feed the left side's stdout to the right side
    Pipe(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListOp {
    AndThen,
    OrElse,
}

impl ListOp {
    fn join(self, left: Expr, right: Expr) -> Expr {
        match self {
            Self::AndThen => Expr::AndThen(Box::new(left), Box::new(right)),
            Self::OrElse => Expr::OrElse(Box::new(left), Box::new(right)),
        }
    }
}

/// Entry point for building commands against one backend
#[derive(Clone)]
pub struct Executor {
    backend: Arc<dyn Backend>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Executor {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Executor running real subprocesses
    pub fn shell(cluster_control: impl Into<String>) -> Self {
        Self::new(Arc::new(ShellBackend::new(cluster_control)))
    }

    /// Start a command whose subprocesses see `env`
    pub fn command(&self, env: Variables) -> CommandBuilder {
        CommandBuilder {
            executor: self.clone(),
            env,
            list: None,
            pipe_head: None,
        }
    }

    pub async fn read_file(&self, path: &Path) -> Result<String> {
        self.backend.read_file(path).await
    }

    pub fn working_directory(&self) -> PathBuf {
        self.backend.working_directory()
    }

    pub fn cluster_control_name(&self) -> &str {
        self.backend.cluster_control_name()
    }
}

/// Builder state that expects a primitive action next
#[must_use]
pub struct CommandBuilder {
    executor: Executor,
    env: Variables,
    list: Option<(Expr, ListOp)>,
    pipe_head: Option<Expr>,
}

impl CommandBuilder {
    pub fn cd(self, path: impl Into<String>) -> Command {
        self.push(Primitive::Cd(path.into()))
    }

    pub fn echo<I, S>(self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Primitive::Echo(collect(args)))
    }

    pub fn eval<I, S>(self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Primitive::Eval(collect(args)))
    }

    pub fn cluster_control<I, S>(self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Primitive::ClusterControl(collect(args)))
    }

    fn push(self, primitive: Primitive) -> Command {
        let leaf = Expr::Leaf(primitive);
        let pipeline = match self.pipe_head {
            Some(head) => Expr::Pipe(Box::new(head), Box::new(leaf)),
            None => leaf,
        };

        Command {
            executor: self.executor,
            env: self.env,
            list: self.list,
            pipeline,
            ignore_interrupts: false,
        }
    }
}

fn collect<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

/// A complete command expression, ready to extend or run
#[must_use]
pub struct Command {
    executor: Executor,
    env: Variables,
    list: Option<(Expr, ListOp)>,
    pipeline: Expr,
    ignore_interrupts: bool,
}

impl Command {
    pub fn and_then(self) -> CommandBuilder {
        self.continue_list(ListOp::AndThen)
    }

    pub fn or_else(self) -> CommandBuilder {
        self.continue_list(ListOp::OrElse)
    }

    pub fn pipe(self) -> CommandBuilder {
        CommandBuilder {
            executor: self.executor,
            env: self.env,
            list: self.list,
            pipe_head: Some(self.pipeline),
        }
    }

    /// Run every primitive with SIGINT ignored
    pub fn ignoring_interrupts(mut self) -> Self {
        self.ignore_interrupts = true;
        self
    }

    /// The composed expression tree
    pub fn expression(&self) -> Expr {
        match &self.list {
            Some((left, op)) => op.join(left.clone(), self.pipeline.clone()),
            None => self.pipeline.clone(),
        }
    }

    /// Expression rendered as a shell command line
    pub fn label(&self) -> String {
        render(&self.expression(), self.executor.cluster_control_name())
    }

    /// Equivalent POSIX script, including the exported variables
    pub fn to_script(&self) -> String {
        let mut script = String::new();
        for (key, value) in &self.env {
            script.push_str(&format!("export {}={}\n", key, quote_arg(value)));
        }
        if self.ignore_interrupts {
            script.push_str("trap '' INT; ");
        }
        script.push_str(&self.label());
        script
    }

    /// Start running in the background, streaming output as it is produced
    pub fn spawn(self) -> RunningCommand {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = self.label();
        let expr = self.expression();
        let mut interpreter = Interpreter::new(&self);

        debug!(command = %label, "spawning command");
        let handle = tokio::spawn(async move {
            interpreter
                .evaluate(&expr, None, LiveOutput::new(tx))
                .await
        });

        RunningCommand {
            label,
            output: rx,
            handle,
        }
    }

    /// Run to completion
    pub async fn run(self) -> Result<CommandOutput, CommandError> {
        let label = self.label();
        let expr = self.expression();
        let mut interpreter = Interpreter::new(&self);

        debug!(command = %label, "running command");
        let out = interpreter
            .evaluate(&expr, None, LiveOutput::discard())
            .await;
        finish(label, out)
    }

    fn continue_list(self, op: ListOp) -> CommandBuilder {
        let left = match self.list {
            Some((left, prev)) => prev.join(left, self.pipeline),
            None => self.pipeline,
        };

        CommandBuilder {
            executor: self.executor,
            env: self.env,
            list: Some((left, op)),
            pipe_head: None,
        }
    }
}

fn render(expr: &Expr, cluster_control: &str) -> String {
    match expr {
        Expr::Leaf(Primitive::Cd(path)) => format!("cd {}", quote_arg(path)),
        Expr::Leaf(Primitive::Echo(args)) => format!("echo {}", quote_args(args)),
        Expr::Leaf(Primitive::Eval(args)) => format!("eval {}", quote_args(args)),
        Expr::Leaf(Primitive::ClusterControl(args)) => {
            format!("{} {}", cluster_control, quote_args(args))
        }
        Expr::AndThen(a, b) => format!(
            "{} && {}",
            render(a, cluster_control),
            render(b, cluster_control)
        ),
        Expr::OrElse(a, b) => format!(
            "{} || {}",
            render(a, cluster_control),
            render(b, cluster_control)
        ),
        Expr::Pipe(a, b) => format!(
            "{} | {}",
            render(a, cluster_control),
            render(b, cluster_control)
        ),
    }
}

fn finish(label: String, out: LeafOutput) -> Result<CommandOutput, CommandError> {
    if out.success() {
        Ok(CommandOutput {
            stdout: out.stdout,
            stderr: out.stderr,
        })
    } else {
        Err(CommandError {
            command: label,
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}

/// Output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A command that exited non-zero, with whatever it printed
#[derive(Debug, Clone, Error)]
pub struct CommandError {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command exited with code {}: {}",
            self.exit_code, self.command
        )?;
        if !self.stdout.trim().is_empty() {
            write!(f, "\nstdout:\n{}", self.stdout.trim_end())?;
        }
        if !self.stderr.trim().is_empty() {
            write!(f, "\nstderr:\n{}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

/// A command running in a background task
pub struct RunningCommand {
    pub label: String,

    /// Live output; closes when the command finishes
    pub output: UnboundedReceiver<OutputChunk>,

    handle: JoinHandle<LeafOutput>,
}

impl RunningCommand {
    /// Wait for completion
    ///
    /// Output not yet taken from [`RunningCommand::output`] is still part of
    /// the captured result.
    pub async fn wait(self) -> Result<CommandOutput, CommandError> {
        match self.handle.await {
            Ok(out) => finish(self.label, out),
            Err(e) => Err(CommandError {
                command: self.label,
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("command task failed: {}", e),
            }),
        }
    }

    /// Abandon the command
    ///
    /// Its output pipes are closed, so a process that is still running ends
    /// on its next write rather than being killed.
    pub async fn stop(self) {
        self.handle.abort();
        // Cancellation is the expected outcome
        let _ = self.handle.await;
    }
}

/// Evaluates an expression, tracking the current directory
struct Interpreter {
    backend: Arc<dyn Backend>,
    env: Variables,
    cwd: PathBuf,
    ignore_interrupts: bool,
}

impl Interpreter {
    fn new(command: &Command) -> Self {
        Self {
            backend: command.executor.backend.clone(),
            env: command.env.clone(),
            cwd: command.executor.working_directory(),
            ignore_interrupts: command.ignore_interrupts,
        }
    }

    fn evaluate<'a>(
        &'a mut self,
        expr: &'a Expr,
        stdin: Option<String>,
        live: LiveOutput,
    ) -> BoxFuture<'a, LeafOutput> {
        async move {
            match expr {
                Expr::Leaf(primitive) => self.primitive(primitive, stdin, &live).await,

                Expr::AndThen(a, b) => {
                    let first = self.evaluate(a, stdin, live.clone()).await;
                    if !first.success() {
                        return first;
                    }
                    let second = self.evaluate(b, None, live).await;
                    LeafOutput {
                        stdout: first.stdout + &second.stdout,
                        stderr: first.stderr + &second.stderr,
                        exit_code: second.exit_code,
                    }
                }

                Expr::OrElse(a, b) => {
                    let first = self.evaluate(a, stdin, live.clone()).await;
                    if first.success() {
                        return first;
                    }
                    let second = self.evaluate(b, None, live).await;
                    // Only the branch that decided the outcome owns stdout
                    LeafOutput {
                        stdout: second.stdout,
                        stderr: first.stderr + &first.stdout + &second.stderr,
                        exit_code: second.exit_code,
                    }
                }

                Expr::Pipe(a, b) => {
                    let upstream = self.evaluate(a, stdin, live.without_stdout()).await;
                    if !upstream.success() {
                        return upstream;
                    }
                    let downstream = self.evaluate(b, Some(upstream.stdout), live).await;
                    LeafOutput {
                        stdout: downstream.stdout,
                        stderr: upstream.stderr + &downstream.stderr,
                        exit_code: downstream.exit_code,
                    }
                }
            }
        }
        .boxed()
    }

    async fn primitive(
        &mut self,
        primitive: &Primitive,
        stdin: Option<String>,
        live: &LiveOutput,
    ) -> LeafOutput {
        let result = match primitive {
            Primitive::Cd(target) => {
                let changed = self.backend.change_directory(&self.cwd, target).await;
                match changed {
                    Ok(dir) => {
                        self.cwd = dir;
                        Ok(LeafOutput::default())
                    }
                    Err(message) => Ok(LeafOutput::failed(1, format!("{}\n", message))),
                }
            }

            Primitive::Echo(args) => {
                let text = format!("{}\n", args.join(" "));
                live.emit(OutputStream::Stdout, &text);
                Ok(LeafOutput::ok(text))
            }

            Primitive::Eval(args) => {
                let ctx = self.context();
                self.backend
                    .eval(&ctx, args, stdin.as_deref(), live)
                    .await
            }

            Primitive::ClusterControl(args) => {
                let ctx = self.context();
                self.backend
                    .cluster_control(&ctx, args, stdin.as_deref(), live)
                    .await
            }
        };

        // A primitive that could not be started behaves like a missing binary
        result.unwrap_or_else(|e| {
            let out = LeafOutput::failed(127, format!("{:#}\n", e));
            live.emit(OutputStream::Stderr, &out.stderr);
            out
        })
    }

    fn context(&self) -> ExecContext<'_> {
        ExecContext {
            cwd: &self.cwd,
            env: &self.env,
            ignore_interrupts: self.ignore_interrupts,
        }
    }
}
