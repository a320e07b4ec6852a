//! pelton - Hierarchical multi-project deploys to Kubernetes
//!
//! A project is a directory with a `pelton.yaml` describing its
//! environments. Environments declare dependencies on other projects, and
//! every (project, environment, isolation key) triple is an activation that
//! is built, rendered and deployed exactly once per invocation.
//!
//! # Architecture
//!
//! - Discovery runs a shell command per dependency and memoizes activations
//! - Stages (build, manifest) run over the graph in dependency order
//! - Deploy applies the rendered resources with pruning, then follows logs
//!
//! # Modules
//!
//! - `adapters`: Execution backends (real shell, simulated)
//! - `core`: Command algebra, graph walker, stages and deploy engine
//! - `domain`: Data structures (ActivationId, ProjectDescriptor, Resource)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Render the manifest of the test environment
//! pelton manifest ./my-project -e test
//!
//! # Build, deploy and follow logs until Ctrl-C
//! pelton start ./my-project -e test -n my-namespace
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{Backend, ShellBackend, SimulatedBackend, SimulatedOutput};
pub use config::RunConfig;
pub use crate::core::{Executor, StageContext};
pub use domain::{ActivationId, ConfigError, ProjectDescriptor, Resource};
