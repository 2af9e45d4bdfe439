use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use tasklaunch_core::{Error, LogStream, Result, ScriptBindings};
use tasklaunch_utils::{configure_process_group, ProcessGuard};

use super::{run_script, Launch, LaunchStrategy};
use crate::executable::{ExecutableContainer, NativeExecutableContainer};
use crate::kill::{KillSwitch, Killable};
use crate::logging::{join_drains, spawn_drain};

const KILL_GRACE: Duration = Duration::from_millis(200);

/// Environment name of a dotted scheduler variable: `scheduler.task.id`
/// becomes `SCHEDULER_TASK_ID`.
#[must_use]
pub fn convert_javaenv_name_to_sysenv(name: &str) -> String {
    name.to_uppercase().replace('.', "_")
}

/// Runs an external command as the task.
///
/// The exit code is the task's value; only failing to start the process,
/// the generation script, or a kill make the task fail.
pub struct NativeTaskLauncher {
    switch: KillSwitch,
}

impl NativeTaskLauncher {
    pub(crate) fn new(switch: KillSwitch) -> Self {
        Self { switch }
    }

    async fn generate_command(
        &self,
        launch: &Launch<'_>,
        container: &NativeExecutableContainer,
    ) -> Result<Vec<String>> {
        let Some(script) = &container.generation_script else {
            return Ok(container.command.clone());
        };
        let generation = run_script(launch, script, "Generation script", ScriptBindings::new());
        let result = launch.unless_killed(generation).await?;
        if let Some(error) = result.error {
            return Err(Error::script("Generation script", error));
        }

        let generated = match result.result {
            None | Some(Value::Null) => None,
            Some(Value::String(line)) => {
                let words = shlex::split(&line).ok_or_else(|| {
                    Error::script(
                        "Generation script",
                        format!("cannot split generated command '{line}'"),
                    )
                })?;
                Some(words)
            }
            Some(Value::Array(items)) => {
                let words = items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(word) => Ok(word),
                        other => Err(Error::script(
                            "Generation script",
                            format!("generated command contains a non-string element: {other}"),
                        )),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(words)
            }
            Some(other) => {
                return Err(Error::script(
                    "Generation script",
                    format!("unsupported generated command: {other}"),
                ))
            }
        };

        match generated {
            Some(words) if !words.is_empty() => {
                tracing::debug!(command = ?words, "command replaced by generation script");
                Ok(words)
            }
            _ if !container.command.is_empty() => Ok(container.command.clone()),
            _ => Err(Error::script(
                "Generation script",
                "no eligible command was found by generation script",
            )),
        }
    }

    async fn run_command(
        &self,
        launch: &Launch<'_>,
        container: NativeExecutableContainer,
    ) -> Result<Value> {
        let argv = self.generate_command(launch, &container).await?;
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::configuration("native task has no command"));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in launch.context.variables() {
            command.env(convert_javaenv_name_to_sysenv(&key), value);
        }
        command.envs(&container.env);
        if let Some(dir) = &container.working_dir {
            command.current_dir(dir);
        }
        configure_process_group(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| Error::process_start(program.clone(), e))?;
        let sink = launch.context.sink();
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, LogStream::Stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, LogStream::Stderr, sink.clone()));
        }
        let mut guard = ProcessGuard::new(child, program.clone());
        tracing::debug!(pid = ?guard.id(), %program, "native process started");

        let join_timeout = launch.services.config().worker.stream_join_timeout;
        let exited = tokio::select! {
            biased;
            reason = self.switch.killed() => Err(reason),
            status = guard.wait() => Ok(status),
        };
        match exited {
            Err(reason) => {
                if let Err(e) = guard.terminate(KILL_GRACE).await {
                    tracing::warn!(error = %e, "failed to reap killed native process");
                }
                join_drains(drains, join_timeout).await;
                Err(launch.kill_error(reason))
            }
            Ok(status) => {
                let status = status?;
                join_drains(drains, join_timeout).await;
                Ok(json!(exit_code(status)))
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[async_trait]
impl LaunchStrategy for NativeTaskLauncher {
    fn name(&self) -> &'static str {
        "native"
    }

    fn kill_target(&self) -> Arc<dyn Killable> {
        Arc::new(self.switch.clone())
    }

    async fn execute(
        &mut self,
        launch: &Launch<'_>,
        container: ExecutableContainer,
    ) -> Result<Value> {
        match container {
            ExecutableContainer::Native(container) => self.run_command(launch, container).await,
            other => Err(Error::configuration(format!(
                "native launcher cannot run a {} executable",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_names_become_env_names() {
        assert_eq!(convert_javaenv_name_to_sysenv("scheduler.task.id"), "SCHEDULER_TASK_ID");
        assert_eq!(convert_javaenv_name_to_sysenv("scheduler.job.name"), "SCHEDULER_JOB_NAME");
        assert_eq!(convert_javaenv_name_to_sysenv("myProp"), "MYPROP");
    }
}
