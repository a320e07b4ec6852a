//! Core deployment logic.
//!
//! This module contains:
//! - Command: composable shell-style commands over an execution backend
//! - Walker: dependency graph discovery with memoization
//! - Pipeline: post-order stage driver
//! - Build / Manifest: the two pipeline stages
//! - Deploy: apply, pod watching and interrupt teardown

pub mod build;
pub mod command;
pub mod deploy;
pub mod display;
pub mod environment;
pub mod manifest;
pub mod pipeline;
pub mod walker;

// Re-export commonly used types
pub use build::{build, BuildOutcome, BuildResults};
pub use command::{
    Command, CommandBuilder, CommandError, CommandOutput, Executor, Expr, Primitive, RunningCommand,
};
pub use deploy::{DeployEngine, LogFormatter, LogLine, Shutdown, PRUNE_ALLOWLIST};
pub use display::{CapturedOutput, Console, DisplayQueue, DisplayTurn};
pub use environment::BaseEnvironment;
pub use manifest::{render_manifest, Manifest};
pub use pipeline::{
    run_in_dependency_order, DependencyOutputs, NodeStage, StageContext, StageFailure, StageRun,
};
pub use walker::{walk, ActivationGraph, ActivationNode, ActivationVisitor, NoopVisitor};
