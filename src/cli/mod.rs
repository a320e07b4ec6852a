//! Command-line interface for pelton.
//!
//! Provides commands for building, rendering and starting a project together
//! with all of its dependencies, and for inspecting a project's variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc::{self, Receiver};
use tracing::debug;

use crate::adapters::{normalize_path, quote_arg};
use crate::config::{RunConfig, DEFAULT_CLUSTER_CONTROL, DEFAULT_NAMESPACE_PREFIX};
use crate::core::{
    build, render_manifest, BuildOutcome, Console, DeployEngine, Executor, Manifest, Shutdown,
    StageContext,
};
use crate::domain::project::descriptor_path;
use crate::domain::{ProjectDescriptor, DEFAULT_ENVIRONMENT, DEFAULT_ISOLATION};

/// pelton - Deploy a project and its dependencies to Kubernetes
#[derive(Parser, Debug)]
#[command(name = "pelton")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Turn on verbose debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Cluster-control command
    #[arg(long, global = true, env = "KUBECTL_CMD", default_value = DEFAULT_CLUSTER_CONTROL)]
    pub kubectl: String,

    /// Prefix of the namespace holding the target's dependencies
    #[arg(
        long,
        global = true,
        env = "PELTON_DEPENDENCY_NAMESPACE_PREFIX",
        default_value = DEFAULT_NAMESPACE_PREFIX
    )]
    pub namespace_prefix: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build target and all dependencies
    Build(TargetArgs),

    /// Generate the manifest of target and dependencies
    Manifest(ManifestArgs),

    /// Start target with its dependencies
    Start {
        #[command(flatten)]
        manifest: ManifestArgs,

        /// Return without following logs or deleting the target
        #[arg(short, long)]
        detach: bool,
    },

    /// Print the target's variables
    Variables(TargetArgs),
}

/// Which activation to operate on
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Project directory (defaults to the current directory)
    pub target_directory: Option<PathBuf>,

    /// Target project environment
    #[arg(short, long, default_value = DEFAULT_ENVIRONMENT)]
    pub environment: String,

    /// Target project isolation key
    #[arg(short, long, default_value = DEFAULT_ISOLATION)]
    pub isolation: String,

    /// Namespace for target project resources
    #[arg(short = 'n', long, default_value = "default")]
    pub target_namespace: String,
}

#[derive(Args, Debug, Clone)]
pub struct ManifestArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Command to further process the manifest (repeatable)
    #[arg(short, long)]
    pub plugin: Vec<String>,

    /// Arguments passed to the target's render command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub project_args: Vec<String>,
}

/// What a command runs against
pub struct Session {
    pub executor: Executor,
    pub config: RunConfig,

    /// Progress output
    pub console: Console,

    /// Command results (manifests, variables)
    pub output: Console,

    /// Directory relative target directories are resolved against
    pub working_directory: PathBuf,
}

impl Session {
    /// Session running real subprocesses on this machine
    pub fn local(config: RunConfig) -> Self {
        let executor = Executor::shell(config.cluster_control.clone());
        Self {
            working_directory: executor.working_directory(),
            executor,
            config,
            console: Console::stderr(),
            output: Console::stdout(),
        }
    }

    fn context(&self, target: &TargetArgs) -> StageContext {
        StageContext::new(
            self.executor.clone(),
            self.config.clone(),
            self.console.clone(),
            target.target_namespace.clone(),
        )
    }

    fn directory(&self, target: &TargetArgs) -> PathBuf {
        match &target.target_directory {
            Some(dir) => normalize_path(&self.working_directory, &dir.to_string_lossy()),
            None => self.working_directory.clone(),
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = RunConfig::new(&self.kubectl, &self.namespace_prefix);
        debug!(run = %config.run_id, "starting");
        let session = Session::local(config);

        if let Some(Shutdown::Forced) = self.command.run(&session, listen_for_interrupts).await? {
            std::process::exit(1);
        }
        Ok(())
    }
}

impl Commands {
    /// Run against `session`; `interrupts` is called once the engine starts
    /// watching
    pub async fn run<F>(self, session: &Session, interrupts: F) -> Result<Option<Shutdown>>
    where
        F: FnOnce() -> Receiver<()>,
    {
        match self {
            Commands::Build(target) => {
                run_build(session, &target).await?;
                Ok(None)
            }
            Commands::Manifest(args) => {
                run_manifest(session, &args).await?;
                Ok(None)
            }
            Commands::Start { manifest, detach } => {
                run_start(session, &manifest, detach, interrupts).await.map(Some)
            }
            Commands::Variables(target) => {
                show_variables(session, &target).await?;
                Ok(None)
            }
        }
    }
}

async fn run_build(session: &Session, target: &TargetArgs) -> Result<BuildOutcome> {
    build(
        &session.context(target),
        &session.directory(target),
        &target.environment,
        &target.isolation,
    )
    .await
}

async fn render(session: &Session, args: &ManifestArgs) -> Result<(BuildOutcome, Manifest)> {
    let target = &args.target;
    let builds = run_build(session, target).await?;
    let manifest = render_manifest(
        &session.context(target),
        &session.directory(target),
        &target.environment,
        &target.isolation,
        &builds,
        &args.plugin,
        &args.project_args,
    )
    .await?;
    Ok((builds, manifest))
}

async fn run_manifest(session: &Session, args: &ManifestArgs) -> Result<()> {
    let (_, manifest) = render(session, args).await?;
    if manifest.yaml.ends_with('\n') {
        session.output.write(&manifest.yaml);
    } else {
        session.output.line(&manifest.yaml);
    }
    Ok(())
}

async fn run_start<F>(
    session: &Session,
    args: &ManifestArgs,
    detach: bool,
    interrupts: F,
) -> Result<Shutdown>
where
    F: FnOnce() -> Receiver<()>,
{
    let (builds, manifest) = render(session, args).await?;

    let engine = DeployEngine::new(session.context(&args.target));
    let interrupts = if detach {
        mpsc::channel(1).1
    } else {
        interrupts()
    };
    engine
        .run(&builds.root, &manifest.resources, detach, interrupts)
        .await
}

async fn show_variables(session: &Session, target: &TargetArgs) -> Result<()> {
    let file = descriptor_path(&session.directory(target));
    let content = session
        .executor
        .read_file(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let descriptor = ProjectDescriptor::parse(&content, &file)?;

    for (key, value) in descriptor.variables_for(&target.environment) {
        session.output.line(&format!("{}={}", key, quote_arg(&value)));
    }
    Ok(())
}

/// Deliver one message per Ctrl-C
fn listen_for_interrupts() -> Receiver<()> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}
