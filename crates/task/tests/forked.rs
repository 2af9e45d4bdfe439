#![cfg(unix)]

use serde_json::json;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use tasklaunch_config::LauncherConfig;
use tasklaunch_core::{FailureKind, ForkEnvironment, JobId, Script, TaskId};
use tasklaunch_task::builtins::{ECHO, PROPAGATE, SLEEP};
use tasklaunch_task::{
    ForkedJavaExecutableContainer, LauncherServices, TaskLauncher, TaskLauncherInitializer,
};

const WORKER: &str = env!("CARGO_BIN_EXE_tasklaunch-worker");

fn task_id(index: u32) -> TaskId {
    TaskId::new(JobId::new(42, "forked"), index, format!("forked-{index}"))
}

fn services(dir: &TempDir, attempts: u32, timeout: Duration) -> LauncherServices {
    let config = LauncherConfig::builder()
        .with_worker_program(WORKER)
        .with_socket_dir(dir.path())
        .with_registration(attempts, timeout)
        .build();
    LauncherServices::new(config)
}

#[tokio::test]
async fn echo_runs_in_a_worker() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut launcher = TaskLauncher::forked_java(
        TaskLauncherInitializer::new(task_id(1)),
        services(&dir, 10, Duration::from_secs(1)),
    );
    let result = launcher
        .do_task(
            None,
            ForkedJavaExecutableContainer::new(ECHO)
                .with_argument("message", "hello from the worker")
                .into(),
            &[],
        )
        .await;

    assert!(!result.had_exception(), "{}", result.textual_description());
    assert_eq!(result.value().unwrap(), &json!("hello from the worker"));
    assert!(result
        .output()
        .unwrap()
        .stdout_logs(false)
        .contains("hello from the worker"));
    launcher.terminate().await;
    Ok(())
}

#[tokio::test]
async fn remote_properties_reach_the_result() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut launcher = TaskLauncher::forked_java(
        TaskLauncherInitializer::new(task_id(2)),
        services(&dir, 10, Duration::from_secs(1)),
    );
    let result = launcher
        .do_task(
            None,
            ForkedJavaExecutableContainer::new(PROPAGATE)
                .with_argument("artifact", "app.tar")
                .into(),
            &[],
        )
        .await;

    assert_eq!(
        result.propagated_properties().get("artifact").map(String::as_str),
        Some("app.tar")
    );
    Ok(())
}

#[tokio::test]
async fn env_script_and_pre_script_run_for_the_worker() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let init = TaskLauncherInitializer::new(task_id(3))
        .with_pre_script(Script::inline("pre", "echo \"greeting=$GREETING $STATIC\""));
    let fork_environment = ForkEnvironment::new()
        .with_env("STATIC", "fixed")
        .with_env_script(Script::inline("env", "echo GREETING=bonjour"));
    let mut launcher =
        TaskLauncher::forked_java(init, services(&dir, 10, Duration::from_secs(1)));
    let result = launcher
        .do_task(
            None,
            ForkedJavaExecutableContainer::new(ECHO)
                .with_fork_environment(fork_environment)
                .into(),
            &[],
        )
        .await;

    assert!(!result.had_exception(), "{}", result.textual_description());
    assert!(result.output_text().contains("greeting=bonjour fixed"));
    Ok(())
}

#[tokio::test]
async fn walltime_applies_to_forked_tasks() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let init = TaskLauncherInitializer::new(task_id(4)).with_walltime(Duration::from_millis(1500));
    let mut launcher =
        TaskLauncher::forked_java(init, services(&dir, 10, Duration::from_secs(1)));
    let started = Instant::now();
    let result = launcher
        .do_task(
            None,
            ForkedJavaExecutableContainer::new(SLEEP)
                .with_argument("millis", 60_000)
                .into(),
            &[],
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(
        result.exception().map(|f| f.kind()),
        Some(FailureKind::WalltimeExceeded)
    );
    Ok(())
}

#[tokio::test]
async fn walltime_interrupts_a_hung_env_script() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let init = TaskLauncherInitializer::new(task_id(7)).with_walltime(Duration::from_millis(200));
    let fork_environment =
        ForkEnvironment::new().with_env_script(Script::inline("env", "sleep 5; echo A=b"));
    let mut launcher =
        TaskLauncher::forked_java(init, services(&dir, 10, Duration::from_secs(1)));
    let started = Instant::now();
    let result = launcher
        .do_task(
            None,
            ForkedJavaExecutableContainer::new(ECHO)
                .with_fork_environment(fork_environment)
                .into(),
            &[],
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(
        result.exception().map(|f| f.kind()),
        Some(FailureKind::WalltimeExceeded)
    );
    Ok(())
}

#[tokio::test]
async fn worker_that_never_registers_fails() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let fork_environment = ForkEnvironment::new()
        .with_worker_program("sh")
        .with_worker_arguments(["-c", "sleep 30", "sh"]);
    let mut launcher = TaskLauncher::forked_java(
        TaskLauncherInitializer::new(task_id(5)),
        services(&dir, 3, Duration::from_millis(100)),
    );
    // 3 attempts of 100 ms, plus room for spawning and reaping the worker
    let budget = Duration::from_millis(300) + Duration::from_millis(400);
    let started = Instant::now();
    let result = launcher
        .do_task(
            None,
            ForkedJavaExecutableContainer::new(ECHO)
                .with_fork_environment(fork_environment)
                .into(),
            &[],
        )
        .await;

    let elapsed = started.elapsed();
    assert!(elapsed < budget, "took {elapsed:?}");
    let failure = result.exception().unwrap();
    assert_eq!(failure.kind(), FailureKind::WorkerSpawn);
    assert!(failure.message().contains("after 3 attempts"));
    Ok(())
}

#[tokio::test]
async fn worker_that_exits_fails_fast() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let fork_environment = ForkEnvironment::new()
        .with_worker_program("sh")
        .with_worker_arguments(["-c", "exit 3", "sh"]);
    let mut launcher = TaskLauncher::forked_java(
        TaskLauncherInitializer::new(task_id(6)),
        services(&dir, 20, Duration::from_millis(500)),
    );
    let started = Instant::now();
    let result = launcher
        .do_task(
            None,
            ForkedJavaExecutableContainer::new(ECHO)
                .with_fork_environment(fork_environment)
                .into(),
            &[],
        )
        .await;

    // Far below the 10 s all attempts would take
    assert!(started.elapsed() < Duration::from_secs(5));
    let failure = result.exception().unwrap();
    assert_eq!(failure.kind(), FailureKind::WorkerSpawn);
    assert!(failure.message().contains("before registering"));
    Ok(())
}
