//! RAII guard for task processes
//!
//! Guarantees that a spawned process group is reaped or killed on every exit
//! path, including errors and panics.

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

use tasklaunch_core::{Error, Result};

use crate::process::{kill_process_tree, signal_process_tree, TreeSignal};

/// RAII guard for a spawned process group
///
/// Dropping the guard while the process is still running kills its whole
/// process group.
pub struct ProcessGuard {
    child: Option<Child>,
    pid: Option<u32>,
    description: String,
}

impl ProcessGuard {
    /// Create a new process guard
    pub fn new(child: Child, description: impl Into<String>) -> Self {
        let pid = child.id();
        Self {
            child: Some(child),
            pid,
            description: description.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait().map_err(|e| {
                Error::command_execution(
                    self.description.clone(),
                    Vec::new(),
                    format!("failed to poll process: {e}"),
                    None,
                )
            }),
            None => Err(Error::configuration("Process already consumed")),
        }
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        match self.child.as_mut() {
            Some(child) => child.wait().await.map_err(|e| {
                Error::command_execution(
                    self.description.clone(),
                    Vec::new(),
                    format!("failed to wait for process: {e}"),
                    None,
                )
            }),
            None => Err(Error::configuration("Process already consumed")),
        }
    }

    /// Kill the process tree and reap the leader
    pub async fn terminate(&mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        if let Ok(Some(status)) = child.try_wait() {
            // Leader is gone, descendants may still hold the group.
            if let Some(pid) = self.pid {
                let _ = signal_process_tree(pid, TreeSignal::Kill);
            }
            return Ok(Some(status));
        }
        let reaped = if self.pid.is_some() {
            kill_process_tree(&mut child, grace).await
        } else {
            let _ = child.start_kill();
            child.wait().await
        };
        let status = reaped.map_err(|e| {
            Error::command_execution(
                self.description.clone(),
                Vec::new(),
                format!("failed to reap process: {e}"),
                None,
            )
        })?;
        Ok(Some(status))
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        log::warn!("Killing leftover process group: {}", self.description);
        match self.pid {
            Some(pid) => {
                if let Err(e) = signal_process_tree(pid, TreeSignal::Kill) {
                    log::warn!("Failed to kill process group {pid}: {e}");
                }
            }
            None => {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::configure_process_group;
    use tokio::process::Command;

    fn spawn_sleeper() -> Child {
        let mut command = Command::new("sleep");
        command.arg("30");
        configure_process_group(&mut command);
        command.spawn().unwrap()
    }

    #[tokio::test]
    async fn terminate_kills_running_process() {
        let mut guard = ProcessGuard::new(spawn_sleeper(), "sleep 30");
        assert!(guard.try_wait().unwrap().is_none());

        let status = guard
            .terminate(Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(guard.terminate(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drop_kills_process_group() {
        use tokio::io::AsyncReadExt;

        let mut command = Command::new("sh");
        command
            .args(["-c", "sleep 30"])
            .stdout(std::process::Stdio::piped());
        configure_process_group(&mut command);
        let mut child = command.spawn().unwrap();
        let mut stdout = child.stdout.take().unwrap();

        drop(ProcessGuard::new(child, "sh -c sleep 30"));

        // EOF only arrives once every holder of the pipe has died.
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stdout.read_to_end(&mut buf))
            .await
            .expect("process group should be killed on drop")
            .unwrap();
    }
}
