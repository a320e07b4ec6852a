//! Execution backends for the command algebra.
//!
//! A backend runs the primitive operations of a composed command (change
//! directory, eval, cluster-control) and serves descriptor reads. The
//! connectives are interpreted once, in [`crate::core::command`], so every
//! backend shares the same sequencing semantics.
//!
//! - [`ShellBackend`]: real `sh` and cluster-control binary
//! - [`SimulatedBackend`]: virtual filesystem, scripted commands and a
//!   scripted cluster, for deterministic tests of every higher layer

pub mod shell;
pub mod simulated;

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::domain::Variables;

// Re-export the backends
pub use shell::{quote_arg, quote_args, ShellBackend};
pub use simulated::{SimulatedBackend, SimulatedOutput};

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A piece of live subprocess output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

/// Where a primitive forwards its output while it runs
///
/// Upstream stages of a pipe keep their stdout to themselves; it is the
/// downstream stage's input, not progress.
#[derive(Debug, Clone)]
pub struct LiveOutput {
    sink: Option<UnboundedSender<OutputChunk>>,
    forward_stdout: bool,
}

impl LiveOutput {
    pub fn new(sink: UnboundedSender<OutputChunk>) -> Self {
        Self {
            sink: Some(sink),
            forward_stdout: true,
        }
    }

    /// Output that goes nowhere
    pub fn discard() -> Self {
        Self {
            sink: None,
            forward_stdout: false,
        }
    }

    pub fn without_stdout(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            forward_stdout: false,
        }
    }

    pub fn emit(&self, stream: OutputStream, text: &str) {
        if text.is_empty() || (stream == OutputStream::Stdout && !self.forward_stdout) {
            return;
        }
        if let Some(sink) = &self.sink {
            // Nobody listening is fine: the output is still captured
            let _ = sink.send(OutputChunk {
                stream,
                text: text.to_string(),
            });
        }
    }
}

/// Settings shared by every primitive of one command
#[derive(Debug, Clone, Copy)]
pub struct ExecContext<'a> {
    /// Current directory, as changed by preceding `cd`s
    pub cwd: &'a Path,

    /// Variables exported to the subprocess
    pub env: &'a Variables,

    /// Run with SIGINT ignored
    pub ignore_interrupts: bool,
}

/// Captured result of one primitive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl LeafOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for execution environments
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Directory a fresh command starts in
    fn working_directory(&self) -> PathBuf;

    /// Cluster-control command, inserted unquoted into rendered scripts
    fn cluster_control_name(&self) -> &str;

    /// Read a file (project descriptors)
    async fn read_file(&self, path: &Path) -> Result<String>;

    /// Resolve `cd target` from `cwd`; the error is the shell's message
    async fn change_directory(&self, cwd: &Path, target: &str) -> Result<PathBuf, String>;

    /// `eval` the space-joined arguments
    async fn eval(
        &self,
        ctx: &ExecContext<'_>,
        args: &[String],
        stdin: Option<&str>,
        live: &LiveOutput,
    ) -> Result<LeafOutput>;

    /// Invoke the cluster-control binary with literal arguments
    async fn cluster_control(
        &self,
        ctx: &ExecContext<'_>,
        args: &[String],
        stdin: Option<&str>,
        live: &LiveOutput,
    ) -> Result<LeafOutput>;
}

/// Lexically resolve `target` against `base` (`..` and `.` collapse,
/// absolute targets replace the base)
pub fn normalize_path(base: &Path, target: &str) -> PathBuf {
    let joined = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        base.join(target)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        let root = Path::new("/");
        assert_eq!(normalize_path(root, "a"), PathBuf::from("/a"));
        assert_eq!(normalize_path(Path::new("/a"), "../b"), PathBuf::from("/b"));
        assert_eq!(normalize_path(Path::new("/b"), "./c"), PathBuf::from("/b/c"));
        assert_eq!(normalize_path(Path::new("/b/c"), "/d"), PathBuf::from("/d"));
        assert_eq!(normalize_path(root, ".."), PathBuf::from("/"));
    }

    #[test]
    fn test_live_output_filters_stdout() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let live = LiveOutput::new(tx);
        let quiet = live.without_stdout();

        quiet.emit(OutputStream::Stdout, "hidden\n");
        quiet.emit(OutputStream::Stderr, "warning\n");
        live.emit(OutputStream::Stdout, "shown\n");
        drop((live, quiet));

        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk.text);
        }
        assert_eq!(chunks, vec!["warning\n".to_string(), "shown\n".to_string()]);
    }
}
