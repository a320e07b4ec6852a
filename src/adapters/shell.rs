//! Real execution through `sh` and the cluster-control binary.
//!
//! Every primitive runs as its own `sh -c` subprocess in the command's
//! current directory, with the command's variables exported on top of the
//! parent environment. Stdout and stderr are read line by line so progress
//! can be displayed while the process runs.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{normalize_path, Backend, ExecContext, LeafOutput, LiveOutput, OutputStream};

/// Characters that force an argument into single quotes
const SHELL_META: &[char] = &[
    ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
    '<', '>', '|', '&', ';', '#', '~',
];

/// Quote a literal argument so `sh` reads it back unchanged
///
/// Plain words pass through; anything else is single-quoted with embedded
/// quotes written as `'\''`.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Quote each argument and join with spaces
pub fn quote_args(args: &[String]) -> String {
    args.iter()
        .map(|a| quote_arg(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Backend running real subprocesses
pub struct ShellBackend {
    /// Cluster-control command (e.g. `kubectl`), inserted unquoted
    cluster_control: String,

    /// Shell used for every primitive
    shell: String,
}

impl ShellBackend {
    /// Create a backend using `sh` and the given cluster-control command
    pub fn new(cluster_control: impl Into<String>) -> Self {
        Self {
            cluster_control: cluster_control.into(),
            shell: "sh".to_string(),
        }
    }

    /// Run one script and capture its output
    async fn run_script(
        &self,
        ctx: &ExecContext<'_>,
        script: String,
        stdin: Option<&str>,
        live: &LiveOutput,
    ) -> Result<LeafOutput> {
        let script = if ctx.ignore_interrupts {
            format!("trap '' INT; {}", script)
        } else {
            script
        };
        debug!(cwd = %ctx.cwd.display(), %script, "spawning");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&script)
            .current_dir(ctx.cwd)
            .envs(ctx.env)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {} for: {}", self.shell, script))?;

        let child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take().context("Child stdout was not captured")?;
        let child_stderr = child.stderr.take().context("Child stderr was not captured")?;

        let feed = async {
            if let (Some(mut pipe), Some(input)) = (child_stdin, stdin) {
                // A consumer that exits without reading is not our failure
                let _ = pipe.write_all(input.as_bytes()).await;
            }
            // Dropping the pipe signals EOF
        };

        let (_, stdout, stderr) = tokio::join!(
            feed,
            pump(child_stdout, OutputStream::Stdout, live),
            pump(child_stderr, OutputStream::Stderr, live),
        );

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for: {}", script))?;

        Ok(LeafOutput {
            stdout: stdout.context("Failed to read stdout")?,
            stderr: stderr.context("Failed to read stderr")?,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

/// Read a stream to its end, forwarding each line as it arrives
async fn pump<R>(reader: R, stream: OutputStream, live: &LiveOutput) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        live.emit(stream, &text);
        captured.push_str(&text);
    }

    Ok(captured)
}

#[async_trait]
impl Backend for ShellBackend {
    fn name(&self) -> &str {
        "shell"
    }

    fn working_directory(&self) -> PathBuf {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    }

    fn cluster_control_name(&self) -> &str {
        &self.cluster_control
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn change_directory(&self, cwd: &Path, target: &str) -> Result<PathBuf, String> {
        let resolved = normalize_path(cwd, target);
        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_dir() => Ok(resolved),
            Ok(_) => Err(format!("cd: {}: Not a directory", target)),
            Err(_) => Err(format!("cd: {}: No such file or directory", target)),
        }
    }

    async fn eval(
        &self,
        ctx: &ExecContext<'_>,
        args: &[String],
        stdin: Option<&str>,
        live: &LiveOutput,
    ) -> Result<LeafOutput> {
        self.run_script(ctx, format!("eval {}", quote_args(args)), stdin, live)
            .await
    }

    async fn cluster_control(
        &self,
        ctx: &ExecContext<'_>,
        args: &[String],
        stdin: Option<&str>,
        live: &LiveOutput,
    ) -> Result<LeafOutput> {
        let script = format!("{} {}", self.cluster_control, quote_args(args));
        self.run_script(ctx, script, stdin, live).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Variables;

    fn context<'a>(cwd: &'a Path, env: &'a Variables) -> ExecContext<'a> {
        ExecContext {
            cwd,
            env,
            ignore_interrupts: false,
        }
    }

    #[test]
    fn test_quote_arg() {
        assert_eq!(quote_arg("version"), "version");
        assert_eq!(quote_arg("hello world"), "'hello world'");
        assert_eq!(quote_arg("X=$X"), "'X=$X'");
        assert_eq!(quote_arg("it's"), "'it'\\''s'");
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn test_quote_args() {
        let args = vec!["eval".to_string(), "echo 'test';".to_string()];
        assert_eq!(quote_args(&args), "eval 'echo '\\''test'\\'';'");
    }

    #[tokio::test]
    async fn test_eval_expands_variables() {
        let backend = ShellBackend::new("kubectl");
        let env: Variables = [("X".to_string(), "EKS".to_string())].into_iter().collect();
        let cwd = std::env::temp_dir();

        let out = backend
            .eval(
                &context(&cwd, &env),
                &["echo".to_string(), "foo".to_string(), "X=$X".to_string()],
                None,
                &LiveOutput::discard(),
            )
            .await
            .unwrap();

        assert!(out.success());
        assert_eq!(out.stdout, "foo X=EKS\n");
    }

    #[tokio::test]
    async fn test_eval_failure_keeps_output() {
        let backend = ShellBackend::new("kubectl");
        let env = Variables::new();
        let cwd = std::env::temp_dir();

        let out = backend
            .eval(
                &context(&cwd, &env),
                &["echo Out of cheese! && exit 3".to_string()],
                None,
                &LiveOutput::discard(),
            )
            .await
            .unwrap();

        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "Out of cheese!\n");
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let backend = ShellBackend::new("kubectl");
        let env = Variables::new();
        let cwd = std::env::temp_dir();

        let out = backend
            .eval(
                &context(&cwd, &env),
                &["cat".to_string()],
                Some("piped\n"),
                &LiveOutput::discard(),
            )
            .await
            .unwrap();

        assert_eq!(out.stdout, "piped\n");
    }

    #[tokio::test]
    async fn test_cluster_control_name_is_unquoted() {
        // Any command works as the cluster-control binary
        let backend = ShellBackend::new("echo kubectl");
        let env = Variables::new();
        let cwd = std::env::temp_dir();

        let out = backend
            .cluster_control(
                &context(&cwd, &env),
                &["get".to_string(), "pods x".to_string()],
                None,
                &LiveOutput::discard(),
            )
            .await
            .unwrap();

        assert_eq!(out.stdout, "kubectl get pods x\n");
    }

    #[tokio::test]
    async fn test_change_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        let backend = ShellBackend::new("kubectl");

        let resolved = backend.change_directory(temp.path(), "sub").await.unwrap();
        assert_eq!(resolved, temp.path().join("sub"));

        let missing = backend.change_directory(temp.path(), "nope").await;
        assert!(missing.unwrap_err().contains("No such file or directory"));
    }
}
