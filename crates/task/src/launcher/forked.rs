use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;

use tasklaunch_config::WorkerSettings;
use tasklaunch_core::{
    Error, ForkEnvironment, LogStream, Result, ScriptBindings, FORKED_NODE_PREFIX,
    WORKER_NODE_COUNT,
};
use tasklaunch_utils::{configure_process_group, ProcessGuard};

use super::{run_script, Launch, LaunchStrategy, LauncherServices};
use crate::executable::{
    ExecutableContainer, ForkedJavaExecutableContainer, JavaExecutableContainer, TaskCode,
};
use crate::forked_executable::ForkedJavaExecutable;
use crate::kill::{KillSwitch, Killable};
use crate::logging::{join_drains, spawn_drain};
use crate::protocol::{ChildRuntime, RegisteredRuntime, Registration, WaitOutcome};

const KILL_GRACE: Duration = Duration::from_millis(200);
/// How long a worker asked to exit gets before its process group is killed
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Runs task code in a dedicated worker process.
///
/// The worker is started with the hub's contact URL and a fresh session id,
/// registers back on the hub, and then hosts a Java launcher that runs the
/// task, its scripts and its walltime. The worker's stdout and stderr end up
/// in this task's log.
pub struct ForkedJavaTaskLauncher {
    switch: KillSwitch,
    executable: Arc<ForkedJavaExecutable>,
    process: Option<ProcessGuard>,
    runtime: Option<ChildRuntime>,
    drains: Vec<JoinHandle<()>>,
}

impl ForkedJavaTaskLauncher {
    pub(crate) fn new(switch: KillSwitch) -> Self {
        Self {
            executable: Arc::new(ForkedJavaExecutable::new(switch.clone())),
            switch,
            process: None,
            runtime: None,
            drains: Vec::new(),
        }
    }

    async fn fork_environment_variables(
        &self,
        launch: &Launch<'_>,
        fork_env: &ForkEnvironment,
    ) -> Result<BTreeMap<String, String>> {
        let mut env = fork_env.system_environment.clone();
        let Some(script) = &fork_env.env_script else {
            return Ok(env);
        };
        let result = launch
            .unless_killed(run_script(launch, script, "Env-script", ScriptBindings::new()))
            .await?;
        if let Some(error) = result.error {
            return Err(Error::script("Env-script", error));
        }
        match result.result {
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    env.insert(key, value);
                }
            }
            Some(Value::String(text)) => {
                for line in text.lines() {
                    match line.split_once('=') {
                        Some((key, value)) if !key.trim().is_empty() => {
                            env.insert(key.trim().to_string(), value.to_string());
                        }
                        _ => tracing::debug!(%line, "env script line is not KEY=VALUE, skipped"),
                    }
                }
            }
            None | Some(Value::Null) => {}
            Some(other) => {
                return Err(Error::script(
                    "Env-script",
                    format!("unsupported environment: {other}"),
                ))
            }
        }
        Ok(env)
    }

    fn spawn_worker(
        &mut self,
        launch: &Launch<'_>,
        fork_env: &ForkEnvironment,
        env: &BTreeMap<String, String>,
        contact_url: &str,
        session_id: u32,
    ) -> Result<()> {
        let settings = &launch.services.config().worker;
        let program = fork_env
            .worker_program
            .clone()
            .unwrap_or_else(|| settings.resolve_program());

        let mut command = Command::new(&program);
        command
            .args(&fork_env.worker_arguments)
            .arg("-p")
            .arg(contact_url)
            .arg("-c")
            .arg(WORKER_NODE_COUNT.to_string())
            .arg("-d")
            .arg(session_id.to_string())
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &fork_env.working_dir {
            command.current_dir(dir);
        }
        configure_process_group(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| Error::worker_spawn(format!("{}: {e}", program.display())))?;
        let sink = launch.context.sink();
        if let Some(stdout) = child.stdout.take() {
            self.drains
                .push(spawn_drain(stdout, LogStream::Stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.drains
                .push(spawn_drain(stderr, LogStream::Stderr, sink.clone()));
        }
        let guard = ProcessGuard::new(child, describe(&program, session_id));
        tracing::debug!(pid = ?guard.id(), session_id, "worker process started");
        self.process = Some(guard);
        Ok(())
    }

    /// Wait for the worker to register, failing fast if it exits first
    async fn await_registration(
        &mut self,
        launch: &Launch<'_>,
        registration: &mut Registration,
        settings: &WorkerSettings,
    ) -> Result<RegisteredRuntime> {
        let attempts = settings.registration_attempts.max(1);
        tracing::debug!(
            attempts,
            budget_ms = u64::try_from(settings.registration_budget().as_millis())
                .unwrap_or(u64::MAX),
            "waiting for worker registration"
        );
        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                biased;
                reason = self.switch.killed() => return Err(launch.kill_error(reason)),
                outcome = registration.wait(settings.registration_timeout) => outcome,
            };
            match outcome {
                WaitOutcome::Registered(runtime) => return Ok(runtime),
                WaitOutcome::Closed => {
                    return Err(Error::worker_spawn("registration channel closed"))
                }
                WaitOutcome::TimedOut => {}
            }

            if let Some(guard) = self.process.as_mut() {
                match guard.try_wait() {
                    Ok(Some(status)) => {
                        return Err(Error::worker_spawn(format!(
                            "worker exited with {status} before registering"
                        )))
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "could not poll worker process"),
                }
            }
            tracing::debug!(
                attempt,
                attempts,
                session_id = registration.session_id(),
                "worker has not registered yet"
            );
        }
        Err(Error::worker_spawn(format!(
            "worker did not register after {attempts} attempts"
        )))
    }

    async fn run_forked(
        &mut self,
        launch: &Launch<'_>,
        container: ForkedJavaExecutableContainer,
    ) -> Result<Value> {
        let ForkedJavaExecutableContainer {
            executable,
            arguments,
            fork_environment,
        } = container;
        let settings = launch.services.config().worker.clone();
        let hub = launch.services.hub().await?;
        let mut registration = hub.subscribe(hub.fresh_session_id())?;
        let session_id = registration.session_id();

        let env = self.fork_environment_variables(launch, &fork_environment).await?;
        self.spawn_worker(launch, &fork_environment, &env, &hub.contact_url(), session_id)?;
        let registered = self
            .await_registration(launch, &mut registration, &settings)
            .await?;
        drop(registration);

        let runtime = ChildRuntime::new(registered);
        tracing::debug!(session_id, pid = runtime.info().pid, "worker registered");
        self.runtime = Some(runtime.clone());

        let node_name = format!("{FORKED_NODE_PREFIX}{session_id}");
        let initializer = launch.initializer.clone();
        let remote = launch
            .unless_killed(async {
                let node = runtime.create_node(&node_name).await?;
                runtime
                    .create_launcher(&node_name, initializer.with_node(node))
                    .await
            })
            .await?;
        self.executable.bind(remote)?;

        let outcome = self.executable.execute(launch, &executable, arguments).await;
        match outcome {
            Err(Error::Protocol { message }) => Err(self.worker_lost(message).await),
            outcome => outcome,
        }
    }

    /// Explain a broken connection by the worker's exit status when there is one
    async fn worker_lost(&mut self, message: String) -> Error {
        if let Some(guard) = self.process.as_mut() {
            if let Ok(Ok(status)) = tokio::time::timeout(KILL_GRACE, guard.wait()).await {
                return Error::execution(format!(
                    "worker process exited with {status} while running the task"
                ));
            }
        }
        Error::protocol(message)
    }
}

fn describe(program: &Path, session_id: u32) -> String {
    format!("worker {} (session {session_id})", program.display())
}

#[async_trait]
impl LaunchStrategy for ForkedJavaTaskLauncher {
    fn name(&self) -> &'static str {
        "forked-java"
    }

    fn runs_scripts_locally(&self) -> bool {
        false
    }

    fn kill_target(&self) -> Arc<dyn Killable> {
        self.executable.clone()
    }

    async fn execute(
        &mut self,
        launch: &Launch<'_>,
        container: ExecutableContainer,
    ) -> Result<Value> {
        let container = match container {
            ExecutableContainer::ForkedJava(container) => container,
            ExecutableContainer::Java(JavaExecutableContainer {
                code: TaskCode::Named(name),
                arguments,
            }) => ForkedJavaExecutableContainer {
                executable: name,
                arguments,
                fork_environment: ForkEnvironment::default(),
            },
            other => {
                return Err(Error::configuration(format!(
                    "forked launcher cannot run a {} executable by instance",
                    other.kind()
                )))
            }
        };
        self.run_forked(launch, container).await
    }

    async fn finalize(&mut self, services: &LauncherServices) {
        let settings = &services.config().worker;
        let asked_to_exit = match self.runtime.take() {
            Some(runtime) => {
                let shutdown = async {
                    runtime.kill_all_nodes().await?;
                    runtime.kill().await
                };
                match tokio::time::timeout(settings.cleanup_timeout, shutdown).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "worker shutdown request failed");
                        false
                    }
                    Err(_) => {
                        tracing::warn!(
                            timeout_ms = u64::try_from(settings.cleanup_timeout.as_millis())
                                .unwrap_or(u64::MAX),
                            "worker did not acknowledge shutdown"
                        );
                        false
                    }
                }
            }
            None => false,
        };

        if let Some(mut guard) = self.process.take() {
            let exited = if asked_to_exit {
                match tokio::time::timeout(EXIT_WAIT, guard.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!(%status, "worker process exited");
                        true
                    }
                    _ => false,
                }
            } else {
                false
            };
            if !exited {
                match guard.terminate(KILL_GRACE).await {
                    Ok(status) => tracing::debug!(?status, "worker process terminated"),
                    Err(e) => tracing::warn!(error = %e, "failed to terminate worker process"),
                }
            }
        }

        join_drains(std::mem::take(&mut self.drains), settings.stream_join_timeout).await;
    }
}
