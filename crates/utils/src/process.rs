//! Process-group helpers.
//!
//! Children spawned for tasks lead their own process group so that a kill
//! reaches every descendant they started.

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Signals used by [`kill_process_tree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    Terminate,
    Kill,
}

/// Make the command's child the leader of a new process group
pub fn configure_process_group(command: &mut Command) {
    #[cfg(unix)]
    {
        command.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = command;
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// A group that no longer exists is not an error.
pub fn signal_process_tree(pid: u32, signal: TreeSignal) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let sig = match signal {
            TreeSignal::Terminate => libc::SIGTERM,
            TreeSignal::Kill => libc::SIGKILL,
        };
        let pgid = libc::pid_t::try_from(pid).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
        })?;
        // SAFETY: killpg only sends a signal, it does not touch our memory.
        let rc = unsafe { libc::killpg(pgid, sig) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        Ok(())
    }
}

/// Terminate the process tree led by `child` and reap the leader.
///
/// The group gets SIGTERM; SIGKILL follows only if the leader is still alive
/// after `grace`. Descendants that outlive the leader are killed as well.
pub async fn kill_process_tree(
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped
        return child.wait().await;
    };
    if let Err(e) = signal_process_tree(pid, TreeSignal::Terminate) {
        tracing::warn!(pid, error = %e, "failed to send SIGTERM to process group");
    }
    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            tracing::debug!(pid, "process group outlived its grace period");
            if let Err(e) = signal_process_tree(pid, TreeSignal::Kill) {
                tracing::warn!(pid, error = %e, "failed to send SIGKILL to process group");
            }
            child.wait().await?
        }
    };
    if let Err(e) = signal_process_tree(pid, TreeSignal::Kill) {
        tracing::warn!(pid, error = %e, "failed to kill leftover process group members");
    }
    Ok(status)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;

    fn spawn_group(script: &str) -> Child {
        let mut command = Command::new("sh");
        command.args(["-c", script]).stdout(Stdio::piped());
        configure_process_group(&mut command);
        command.spawn().unwrap()
    }

    #[tokio::test]
    async fn tree_kill_reaches_grandchildren() {
        let mut child = spawn_group("sleep 30 & sleep 30; wait");
        let pid = child.id().unwrap();
        let mut stdout = child.stdout.take().unwrap();

        let status = tokio::time::timeout(
            Duration::from_secs(5),
            kill_process_tree(&mut child, Duration::from_millis(50)),
        )
        .await
        .expect("child should exit after tree kill")
        .unwrap();
        assert!(!status.success());

        // EOF only arrives once the backgrounded sleep is gone too.
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stdout.read_to_end(&mut buf))
            .await
            .expect("grandchild should be killed")
            .unwrap();
        signal_process_tree(pid, TreeSignal::Kill).unwrap();
    }

    #[tokio::test]
    async fn prompt_exit_skips_the_grace_period() {
        let mut child = spawn_group("exec sleep 30");
        let started = Instant::now();

        let status = kill_process_tree(&mut child, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stubborn_group_is_killed_after_grace() {
        let mut child = spawn_group("trap '' TERM; sleep 30 & wait; sleep 30");
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();

        let status = kill_process_tree(&mut child, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!status.success());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
