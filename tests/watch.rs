//! Watch Phase Integration Tests
//!
//! Drives `start` against a cluster whose pod log streams stay open and
//! whose deletions block until the test releases them, so interrupts can
//! be delivered at exact points of the watch and teardown.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc::{self, Sender, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use pelton::adapters::{
    Backend, ExecContext, LeafOutput, LiveOutput, OutputStream, SimulatedBackend,
};
use pelton::cli::{Cli, Session};
use pelton::core::{CapturedOutput, Console, Executor, Shutdown};
use pelton::RunConfig;

const WEB: &str = r#"projectName: web
environments:
  default:
    podSelectorCommand: app=web
    manifestRenderCommand: |
      echo "
      kind: ConfigMap
      metadata:
        name: web-cm
      "
"#;

/// Project files from a simulated backend in front of a test-driven cluster
struct LiveCluster {
    files: SimulatedBackend,
    pods: String,
    log_lines: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    release_delete: Notify,
    calls: Mutex<Vec<Vec<String>>>,
}

impl LiveCluster {
    fn deletes(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some("delete"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Backend for LiveCluster {
    fn name(&self) -> &str {
        "live"
    }

    fn working_directory(&self) -> PathBuf {
        self.files.working_directory()
    }

    fn cluster_control_name(&self) -> &str {
        "kubectl"
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        self.files.read_file(path).await
    }

    async fn change_directory(&self, cwd: &Path, target: &str) -> Result<PathBuf, String> {
        self.files.change_directory(cwd, target).await
    }

    async fn eval(
        &self,
        ctx: &ExecContext<'_>,
        args: &[String],
        stdin: Option<&str>,
        live: &LiveOutput,
    ) -> Result<LeafOutput> {
        self.files.eval(ctx, args, stdin, live).await
    }

    async fn cluster_control(
        &self,
        _ctx: &ExecContext<'_>,
        args: &[String],
        _stdin: Option<&str>,
        live: &LiveOutput,
    ) -> Result<LeafOutput> {
        self.calls.lock().unwrap().push(args.to_vec());

        match args.first().map(String::as_str) {
            Some("get") if args.get(1).map(String::as_str) == Some("pods") => {
                Ok(LeafOutput::ok(self.pods.clone()))
            }
            Some("logs") => {
                let mut lines = self.log_lines.lock().await;
                let mut captured = String::new();
                while let Some(line) = lines.recv().await {
                    live.emit(OutputStream::Stdout, &line);
                    captured.push_str(&line);
                }
                Ok(LeafOutput::ok(captured))
            }
            Some("delete") => {
                self.release_delete.notified().await;
                let out = format!("{} deleted\n", args[3..].join(" "));
                live.emit(OutputStream::Stdout, &out);
                Ok(LeafOutput::ok(out))
            }
            _ => Ok(LeafOutput::default()),
        }
    }
}

struct Started {
    cluster: Arc<LiveCluster>,
    console: CapturedOutput,
    log_lines: UnboundedSender<String>,
    interrupts: Sender<()>,
    task: JoinHandle<Result<Option<Shutdown>>>,
}

/// Run `start web` in the background against a cluster reporting `pods`
fn start(pods: &str) -> Started {
    let (log_lines, log_rx) = mpsc::unbounded_channel();
    let cluster = Arc::new(LiveCluster {
        files: SimulatedBackend::new().with_file("/work/web/pelton.yaml", WEB),
        pods: pods.to_string(),
        log_lines: tokio::sync::Mutex::new(log_rx),
        release_delete: Notify::new(),
        calls: Mutex::new(Vec::new()),
    });
    let (console, console_text) = Console::capture();
    let (output, _) = Console::capture();

    let session = Session {
        executor: Executor::new(cluster.clone()),
        config: RunConfig::default()
            .with_run_id("abc234")
            .with_pod_poll_interval(Duration::from_millis(5)),
        console,
        output,
        working_directory: PathBuf::from("/work"),
    };

    let (interrupts, interrupt_rx) = mpsc::channel(4);
    let task = tokio::spawn(async move {
        let cli = Cli::try_parse_from(["pelton", "start", "web"])?;
        cli.command.run(&session, move || interrupt_rx).await
    });

    Started {
        cluster,
        console: console_text,
        log_lines,
        interrupts,
        task,
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn finished(task: JoinHandle<Result<Option<Shutdown>>>) -> Option<Shutdown> {
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("engine did not return")
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_interrupt_while_streaming_tears_down_and_flushes() {
    let started = start("web-1");
    started.log_lines.send("before\n".to_string()).unwrap();

    let console = started.console.clone();
    eventually("the first log line", || console.contents().contains("web-1 out> before")).await;

    started.interrupts.send(()).await.unwrap();
    let cluster = started.cluster.clone();
    eventually("the teardown to start", || !cluster.deletes().is_empty()).await;

    // Lines arriving during teardown are held back
    started.log_lines.send("during\n".to_string()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!started.console.contents().contains("during"));

    started.cluster.release_delete.notify_one();

    // The stream is still open, so the engine must stop it itself
    assert_eq!(finished(started.task).await, Some(Shutdown::TornDown));

    let console = started.console.contents();
    let stopping = console.find("==> Stopping web.default.a...").unwrap();
    let during = console.find("during").unwrap();
    assert!(stopping < during, "{}", console);

    assert_eq!(
        started.cluster.deletes(),
        vec![vec![
            "delete".to_string(),
            "-n".to_string(),
            "default".to_string(),
            "ConfigMap/web-cm".to_string(),
        ]]
    );
    drop(started.log_lines);
}

#[tokio::test]
async fn test_second_interrupt_during_teardown_forces_exit() {
    let started = start("web-1");
    started.log_lines.send("hello\n".to_string()).unwrap();

    let console = started.console.clone();
    eventually("the first log line", || console.contents().contains("web-1 out> hello")).await;

    started.interrupts.send(()).await.unwrap();
    let cluster = started.cluster.clone();
    eventually("the teardown to start", || !cluster.deletes().is_empty()).await;

    started.interrupts.send(()).await.unwrap();
    assert_eq!(finished(started.task).await, Some(Shutdown::Forced));
    drop(started.log_lines);
}

#[tokio::test]
async fn test_second_interrupt_while_waiting_for_pods_forces_exit() {
    let started = start("");

    let console = started.console.clone();
    eventually("the pod wait", || console.contents().contains("Waiting for at least one pod...")).await;

    started.interrupts.send(()).await.unwrap();
    let cluster = started.cluster.clone();
    eventually("the teardown to start", || !cluster.deletes().is_empty()).await;

    started.interrupts.send(()).await.unwrap();
    assert_eq!(finished(started.task).await, Some(Shutdown::Forced));
    assert!(started
        .cluster
        .calls
        .lock()
        .unwrap()
        .iter()
        .all(|args| args.first().map(String::as_str) != Some("logs")));
}
