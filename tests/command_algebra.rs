//! Command Algebra Integration Tests
//!
//! Composed commands against the simulated backend, plus a few checks that
//! the real shell backend agrees with it.

use std::sync::Arc;

use pelton::adapters::{SimulatedBackend, SimulatedOutput};
use pelton::core::Executor;
use pelton::domain::Variables;

fn vars(pairs: &[(&str, &str)]) -> Variables {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn simulated(backend: SimulatedBackend) -> Executor {
    Executor::new(Arc::new(backend))
}

#[tokio::test]
async fn test_cd_tracks_working_directory() {
    let executor = simulated(SimulatedBackend::new());

    let out = executor
        .command(Variables::new())
        .eval(["pwd"])
        .and_then()
        .cd("a")
        .and_then()
        .eval(["pwd"])
        .and_then()
        .cd("../b")
        .and_then()
        .eval(["pwd"])
        .and_then()
        .cd("c")
        .and_then()
        .eval(["pwd"])
        .and_then()
        .cd("/d")
        .and_then()
        .eval(["pwd"])
        .run()
        .await
        .unwrap();

    assert_eq!(out.stdout, "/\n/a\n/b\n/b/c\n/d\n");
}

#[tokio::test]
async fn test_echo_is_literal() {
    let executor = simulated(SimulatedBackend::new());

    let out = executor
        .command(vars(&[("X", "EKS")]))
        .echo(["foo", "X=$X"])
        .run()
        .await
        .unwrap();

    assert_eq!(out.stdout, "foo X=$X\n");
}

#[tokio::test]
async fn test_eval_echo_expands_variables() {
    let executor = simulated(SimulatedBackend::new());

    let out = executor
        .command(vars(&[("X", "EKS")]))
        .eval(["echo", "foo", "X=$X"])
        .run()
        .await
        .unwrap();

    assert_eq!(out.stdout, "foo X=EKS\n");
}

#[tokio::test]
async fn test_echo_piped_to_cluster_control() {
    let backend = Arc::new(SimulatedBackend::new().with_cluster(|stdin, args| {
        assert_eq!(stdin, "foo\n");
        assert_eq!(args, ["bar".to_string()]);
        SimulatedOutput::ok("kubectl called!\n")
    }));
    let executor = Executor::new(backend.clone());

    let out = executor
        .command(Variables::new())
        .echo(["foo"])
        .pipe()
        .cluster_control(["bar"])
        .run()
        .await
        .unwrap();

    assert_eq!(out.stdout, "kubectl called!\n");
    assert_eq!(backend.cluster_calls().len(), 1);
}

#[tokio::test]
async fn test_eval_cat_reads_relative_to_cwd() {
    let executor = simulated(
        SimulatedBackend::new()
            .with_file("/a", "file a")
            .with_file("/d1/b", "file b"),
    );

    let out = executor
        .command(Variables::new())
        .eval(["cat", "a"])
        .and_then()
        .eval(["cat", "/d1/b"])
        .and_then()
        .cd("d1")
        .and_then()
        .eval(["cat", "b"])
        .and_then()
        .eval(["cat", "/a"])
        .run()
        .await
        .unwrap();

    assert_eq!(out.stdout, "file a\nfile b\nfile b\nfile a\n");
}

#[tokio::test]
async fn test_custom_command_exit_codes() {
    let executor = simulated(
        SimulatedBackend::new()
            .with_command("custom", SimulatedOutput::ok("custom command!\n"))
            .with_command("broken", SimulatedOutput::fail("Out of cheese!\n")),
    );

    let out = executor
        .command(Variables::new())
        .eval(["custom"])
        .run()
        .await
        .unwrap();
    assert_eq!(out.stdout, "custom command!\n");

    let err = executor
        .command(Variables::new())
        .eval(["broken"])
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.exit_code, 1);
    assert_eq!(err.stdout, "Out of cheese!\n");
}

#[tokio::test]
async fn test_cluster_control_exit_codes() {
    let executor = simulated(SimulatedBackend::new().with_cluster(|_, args| {
        if args.first().map(String::as_str) == Some("get") {
            SimulatedOutput::ok("pod-1 pod-2")
        } else {
            SimulatedOutput::fail("").with_stderr("No such namespace: x\n")
        }
    }));

    let out = executor
        .command(Variables::new())
        .cluster_control(["get", "pods"])
        .run()
        .await
        .unwrap();
    assert_eq!(out.stdout, "pod-1 pod-2");

    let err = executor
        .command(Variables::new())
        .cluster_control(["delete", "namespace", "x"])
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.stderr, "No such namespace: x\n");
}

#[tokio::test]
async fn test_or_else_short_circuits() {
    let executor = simulated(
        SimulatedBackend::new().with_command("custom", SimulatedOutput::fail("")),
    );

    let out = executor
        .command(Variables::new())
        .echo(["1"])
        .or_else()
        .echo(["2"])
        .run()
        .await
        .unwrap();
    assert_eq!(out.stdout, "1\n");

    let out = executor
        .command(Variables::new())
        .eval(["custom"])
        .or_else()
        .echo(["else!"])
        .run()
        .await
        .unwrap();
    assert_eq!(out.stdout, "else!\n");
}

#[tokio::test]
async fn test_get_or_create_namespace() {
    let executor = simulated(SimulatedBackend::new().with_cluster(|_, args| match args[0].as_str() {
        "get" => SimulatedOutput::fail("").with_stderr("not found\n"),
        _ => SimulatedOutput::ok(format!("namespace/{} created\n", args[2])),
    }));

    let out = executor
        .command(Variables::new())
        .cluster_control(["get", "namespace", "pltn-x"])
        .or_else()
        .cluster_control(["create", "namespace", "pltn-x"])
        .run()
        .await
        .unwrap();

    assert_eq!(out.stdout, "namespace/pltn-x created\n");
    assert_eq!(out.stderr, "not found\n");
}

#[tokio::test]
async fn test_shell_backend_agrees() {
    let temp = tempfile::TempDir::new().unwrap();
    std::fs::write(temp.path().join("a"), "file a\n").unwrap();

    let shell = Executor::shell("kubectl");
    let root = temp.path().to_string_lossy().to_string();

    let out = shell
        .command(vars(&[("X", "EKS")]))
        .cd(root.as_str())
        .and_then()
        .echo(["foo", "X=$X"])
        .and_then()
        .eval(["echo", "foo", "X=$X"])
        .and_then()
        .eval(["cat", "a"])
        .pipe()
        .eval(["cat"])
        .run()
        .await
        .unwrap();
    assert_eq!(out.stdout, "foo X=$X\nfoo X=EKS\nfile a\n");

    let out = shell
        .command(Variables::new())
        .eval(["false"])
        .or_else()
        .echo(["else!"])
        .run()
        .await
        .unwrap();
    assert_eq!(out.stdout, "else!\n");
}
