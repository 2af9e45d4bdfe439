//! Script execution facility used for pre-, post-, generation and env scripts.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;

use tasklaunch_core::{
    Error, ExecutionNode, Result, Script, ScriptBindings, ScriptResult, ScriptSource,
};

use crate::launcher::convert_javaenv_name_to_sysenv;

/// Environment variable carrying the name of the node a script runs on
pub const NODE_NAME_VAR: &str = "TASKLAUNCH_NODE_NAME";
/// Environment variable carrying the host of the node a script runs on
pub const NODE_HOST_VAR: &str = "TASKLAUNCH_NODE_HOST";

/// Runs user scripts.
///
/// An `Err` means the script could not be run at all; a script that ran and
/// failed is reported through [`ScriptResult::error`].
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run_script(
        &self,
        script: &Script,
        node: Option<&ExecutionNode>,
        bindings: &ScriptBindings,
    ) -> Result<ScriptResult>;
}

/// Runs scripts through a POSIX shell.
///
/// Bindings are exported as environment variables (dotted names become
/// `UPPER_SNAKE`). Trimmed stdout is the script's result: JSON when it looks
/// like an array or object, a string otherwise, nothing when empty.
#[derive(Debug, Clone)]
pub struct ShellScriptRunner {
    shell: String,
}

impl ShellScriptRunner {
    #[must_use]
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn command(&self, script: &Script) -> Command {
        let mut command = Command::new(&self.shell);
        match &script.source {
            ScriptSource::Inline(body) => {
                command.arg("-c").arg(body).arg(&script.id);
            }
            ScriptSource::File(path) => {
                command.arg(path);
            }
        }
        command.args(&script.arguments);
        command
    }
}

impl Default for ShellScriptRunner {
    fn default() -> Self {
        Self::new(tasklaunch_core::DEFAULT_SHELL)
    }
}

#[async_trait]
impl ScriptRunner for ShellScriptRunner {
    async fn run_script(
        &self,
        script: &Script,
        node: Option<&ExecutionNode>,
        bindings: &ScriptBindings,
    ) -> Result<ScriptResult> {
        let mut command = self.command(script);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in bindings {
            command.env(convert_javaenv_name_to_sysenv(name), value);
        }
        if let Some(node) = node {
            command.env(NODE_NAME_VAR, &node.name);
            command.env(NODE_HOST_VAR, &node.host);
        }

        tracing::debug!(script = %script.id, shell = %self.shell, "running script");
        let output = command.output().await.map_err(|e| {
            Error::command_execution(
                self.shell.clone(),
                vec![script.id.clone()],
                format!("failed to run script: {e}"),
                None,
            )
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let error = (!output.status.success()).then(|| {
            let detail = stderr.trim();
            match output.status.code() {
                Some(code) if detail.is_empty() => format!("exited with code {code}"),
                Some(code) => format!("exited with code {code}: {detail}"),
                None => format!("terminated by signal: {detail}"),
            }
        });

        Ok(ScriptResult {
            result: parse_result(&stdout),
            error,
            stdout,
            stderr,
        })
    }
}

fn parse_result(stdout: &str) -> Option<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return Some(value);
        }
    }
    Some(Value::String(trimmed.to_string()))
}

/// Node describing the current process
#[must_use]
pub fn local_node(name: impl Into<String>) -> ExecutionNode {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    ExecutionNode::new(name, host)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stdout_becomes_result() {
        let runner = ShellScriptRunner::default();
        let mut bindings = ScriptBindings::new();
        bindings.insert("scheduler.task.id".into(), "10001".into());

        let result = runner
            .run_script(
                &Script::inline("pre", "echo \"task $SCHEDULER_TASK_ID on $TASKLAUNCH_NODE_NAME\""),
                Some(&local_node("node-1")),
                &bindings,
            )
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.result, Some(json!("task 10001 on node-1")));
    }

    #[tokio::test]
    async fn json_arrays_are_parsed() {
        let runner = ShellScriptRunner::default();
        let result = runner
            .run_script(
                &Script::inline("gen", r#"echo '["echo", "a b"]'"#),
                None,
                &ScriptBindings::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!(["echo", "a b"])));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_script_error() {
        let runner = ShellScriptRunner::default();
        let result = runner
            .run_script(
                &Script::inline("post", "echo oops >&2; exit 4"),
                None,
                &ScriptBindings::new(),
            )
            .await
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("exited with code 4: oops"));
        assert!(result.result.is_none());
    }

    #[tokio::test]
    async fn missing_shell_is_an_infrastructure_error() {
        let runner = ShellScriptRunner::new("/nonexistent/shell");
        let err = runner
            .run_script(&Script::inline("pre", "true"), None, &ScriptBindings::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to run script"));
    }
}
