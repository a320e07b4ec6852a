//! Fully simulated execution environment.
//!
//! Serves `cd` and `eval cat` from a virtual filesystem, answers `eval
//! <name>` from a table of scripted commands, and hands every
//! cluster-control invocation to a caller-supplied function receiving
//! `(stdin, argv)`. `eval echo` expands `$VAR`/`${VAR}` from the command's
//! variables the way a shell would.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{normalize_path, Backend, ExecContext, LeafOutput, LiveOutput, OutputStream};
use crate::domain::Variables;

/// Response of a scripted command or of the scripted cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl SimulatedOutput {
    /// Successful output
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Exit 1 after printing `stdout`
    pub fn fail(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: 1,
            ..Default::default()
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }
}

impl From<SimulatedOutput> for LeafOutput {
    fn from(out: SimulatedOutput) -> Self {
        Self {
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: out.exit_code,
        }
    }
}

/// Scripted behaviour receiving `(stdin, argv)`
pub type ScriptFn = dyn Fn(&str, &[String]) -> SimulatedOutput + Send + Sync;

/// Backend with no real shell, filesystem or cluster
pub struct SimulatedBackend {
    files: RwLock<BTreeMap<PathBuf, String>>,
    commands: HashMap<String, Arc<ScriptFn>>,
    cluster: Arc<ScriptFn>,
    cluster_calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// Empty filesystem, no commands, a cluster that accepts everything
    pub fn new() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            commands: HashMap::new(),
            cluster: Arc::new(|_, _| SimulatedOutput::default()),
            cluster_calls: Mutex::new(Vec::new()),
        }
    }

    /// Add a file; relative paths are taken from `/`
    pub fn with_file(self, path: impl AsRef<str>, contents: impl Into<String>) -> Self {
        self.write_file(path, contents);
        self
    }

    /// Add a command with a fixed response
    pub fn with_command(self, name: impl Into<String>, output: SimulatedOutput) -> Self {
        self.with_command_fn(name, move |_, _| output.clone())
    }

    /// Add a command computed from `(stdin, args)`
    pub fn with_command_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str, &[String]) -> SimulatedOutput + Send + Sync + 'static,
    {
        self.commands.insert(name.into(), Arc::new(f));
        self
    }

    /// Replace the scripted cluster
    pub fn with_cluster<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[String]) -> SimulatedOutput + Send + Sync + 'static,
    {
        self.cluster = Arc::new(f);
        self
    }

    pub fn write_file(&self, path: impl AsRef<str>, contents: impl Into<String>) {
        let path = normalize_path(Path::new("/"), path.as_ref());
        if let Ok(mut files) = self.files.write() {
            files.insert(path, contents.into());
        }
    }

    /// Every cluster-control invocation so far, as `(stdin, argv)`
    pub fn cluster_calls(&self) -> Vec<(String, Vec<String>)> {
        self.cluster_calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn read(&self, path: &Path) -> Option<String> {
        self.files.read().ok()?.get(path).cloned()
    }

    fn cat(&self, cwd: &Path, files: &[String], stdin: Option<&str>) -> LeafOutput {
        if files.is_empty() {
            return LeafOutput::ok(stdin.unwrap_or_default());
        }

        let mut out = LeafOutput::default();
        for file in files {
            match self.read(&normalize_path(cwd, file)) {
                Some(contents) => {
                    out.stdout.push_str(&contents);
                    out.stdout.push('\n');
                }
                None => {
                    out.stderr
                        .push_str(&format!("cat: {}: No such file or directory\n", file));
                    out.exit_code = 1;
                }
            }
        }
        out
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn working_directory(&self) -> PathBuf {
        PathBuf::from("/")
    }

    fn cluster_control_name(&self) -> &str {
        "kubectl"
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        let path = normalize_path(Path::new("/"), &path.to_string_lossy());
        self.read(&path)
            .ok_or_else(|| anyhow!("No such file: {}", path.display()))
    }

    async fn change_directory(&self, cwd: &Path, target: &str) -> Result<PathBuf, String> {
        Ok(normalize_path(cwd, target))
    }

    async fn eval(
        &self,
        ctx: &ExecContext<'_>,
        args: &[String],
        stdin: Option<&str>,
        live: &LiveOutput,
    ) -> Result<LeafOutput> {
        let out = match shell_words(&args.join(" "), ctx.env) {
            Err(message) => LeafOutput::failed(2, format!("eval: {}\n", message)),
            Ok(words) => match words.split_first() {
                None => LeafOutput::default(),
                Some((cmd, rest)) => match cmd.as_str() {
                    "cat" => self.cat(ctx.cwd, rest, stdin),
                    "echo" => LeafOutput::ok(format!("{}\n", rest.join(" "))),
                    "pwd" => LeafOutput::ok(format!("{}\n", ctx.cwd.display())),
                    "true" => LeafOutput::default(),
                    "false" => LeafOutput::failed(1, ""),
                    name => match self.commands.get(name) {
                        Some(script) => script(stdin.unwrap_or_default(), rest).into(),
                        None => LeafOutput::failed(127, format!("{}: command not found\n", name)),
                    },
                },
            },
        };

        live.emit(OutputStream::Stdout, &out.stdout);
        live.emit(OutputStream::Stderr, &out.stderr);
        Ok(out)
    }

    async fn cluster_control(
        &self,
        _ctx: &ExecContext<'_>,
        args: &[String],
        stdin: Option<&str>,
        live: &LiveOutput,
    ) -> Result<LeafOutput> {
        let input = stdin.unwrap_or_default();
        if let Ok(mut calls) = self.cluster_calls.lock() {
            calls.push((input.to_string(), args.to_vec()));
        }

        let out: LeafOutput = (self.cluster)(input, args).into();
        live.emit(OutputStream::Stdout, &out.stdout);
        live.emit(OutputStream::Stderr, &out.stderr);
        Ok(out)
    }
}

/// Split a command line into words, expanding variables
///
/// Single quotes are literal, double quotes expand `$VAR` and honour `\"`,
/// `\\` and `\$`, and unquoted backslashes escape the next character.
fn shell_words(line: &str, env: &Variables) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.peek() {
                            Some(&next @ ('"' | '\\' | '$')) => {
                                word.push(next);
                                chars.next();
                            }
                            _ => word.push('\\'),
                        },
                        Some('$') => expand(&mut chars, env, &mut word),
                        Some(c) => word.push(c),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            '$' => {
                in_word = true;
                expand(&mut chars, env, &mut word);
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    if in_word {
        words.push(word);
    }

    Ok(words)
}

/// Expand the variable reference following a `$`
fn expand(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, env: &Variables, out: &mut String) {
    let braced = chars.peek() == Some(&'{');
    if braced {
        chars.next();
    }

    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        let valid = c == '_' || c.is_ascii_alphabetic() || (!name.is_empty() && c.is_ascii_digit());
        if !valid {
            break;
        }
        name.push(c);
        chars.next();
    }

    if braced {
        if chars.peek() == Some(&'}') {
            chars.next();
        }
    } else if name.is_empty() {
        out.push('$');
        return;
    }

    if let Some(value) = env.get(&name) {
        out.push_str(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_shell_words_quoting() {
        let env = vars(&[("X", "EKS")]);
        assert_eq!(
            shell_words("echo foo X=$X", &env).unwrap(),
            vec!["echo", "foo", "X=EKS"]
        );
        assert_eq!(
            shell_words("echo 'X=$X' \"${X}s\"", &env).unwrap(),
            vec!["echo", "X=$X", "EKSs"]
        );
        assert_eq!(
            shell_words("echo \"a  b\" c\\ d", &env).unwrap(),
            vec!["echo", "a  b", "c d"]
        );
        assert_eq!(shell_words("echo $ $UNSET.", &env).unwrap(), vec!["echo", "$", "."]);
        assert!(shell_words("echo 'oops", &env).is_err());
    }

    #[test]
    fn test_shell_words_multiline_double_quotes() {
        let env = vars(&[("PELTON_ENVIRONMENT", "foo")]);
        let words = shell_words("echo \"kind: ConfigMap\nname: x-$PELTON_ENVIRONMENT\"", &env).unwrap();
        assert_eq!(words, vec!["echo", "kind: ConfigMap\nname: x-foo"]);
    }

    #[tokio::test]
    async fn test_unknown_command_exits_127() {
        let backend = SimulatedBackend::new();
        let env = Variables::new();
        let ctx = ExecContext {
            cwd: Path::new("/"),
            env: &env,
            ignore_interrupts: false,
        };

        let out = backend
            .eval(&ctx, &["nope".to_string()], None, &LiveOutput::discard())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 127);
    }

    #[tokio::test]
    async fn test_read_file() {
        let backend = SimulatedBackend::new().with_file("/p/pelton.yaml", "projectName: p");
        assert_eq!(
            backend.read_file(Path::new("/p/pelton.yaml")).await.unwrap(),
            "projectName: p"
        );
        assert!(backend.read_file(Path::new("/q/pelton.yaml")).await.is_err());
    }
}
