//! Parent-side stand-in for task code running in a forked worker.

use once_cell::sync::OnceCell;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

use tasklaunch_core::{Error, Payload, Result};

use crate::executable::TaskArguments;
use crate::kill::{KillReason, KillSwitch, Killable};
use crate::launcher::Launch;
use crate::protocol::RemoteTaskLauncher;

/// Delegates execution to a remote launcher and relays kills to it.
///
/// The remote launcher is bound once the worker is up; a kill that arrives
/// earlier only flips the local switch, which the launcher observes while
/// waiting for the worker.
pub struct ForkedJavaExecutable {
    switch: KillSwitch,
    remote: OnceCell<RemoteTaskLauncher>,
    killed: AtomicBool,
}

impl ForkedJavaExecutable {
    pub(crate) fn new(switch: KillSwitch) -> Self {
        Self {
            switch,
            remote: OnceCell::new(),
            killed: AtomicBool::new(false),
        }
    }

    pub(crate) fn bind(&self, remote: RemoteTaskLauncher) -> Result<()> {
        self.remote
            .set(remote)
            .map_err(|_| Error::configuration("forked executable is already bound to a worker"))
    }

    /// Run `executable` remotely and wait for its result or a kill.
    ///
    /// Properties the remote task propagated are copied into the task context.
    pub(crate) async fn execute(
        &self,
        launch: &Launch<'_>,
        executable: &str,
        arguments: TaskArguments,
    ) -> Result<Value> {
        let remote = self
            .remote
            .get()
            .ok_or_else(|| Error::configuration("forked executable is not bound to a worker"))?;
        let pending = remote.do_task(executable, arguments, launch.parents).await?;

        let result = tokio::select! {
            biased;
            reason = self.switch.killed() => return Err(launch.kill_error(reason)),
            result = pending => result?,
        };

        for (key, value) in result.propagated_properties() {
            launch.context.propagate(key.clone(), value.clone());
        }
        match result.payload() {
            Payload::Value(value) => Ok(value.clone()),
            Payload::Failure(failure) => Err(Error::Task(failure.clone())),
            Payload::Cleaned { .. } => {
                Err(Error::protocol("worker returned a cleaned task result"))
            }
        }
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl Killable for ForkedJavaExecutable {
    fn kill(&self, reason: KillReason) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.switch.kill(reason);
        let Some(remote) = self.remote.get().cloned() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = remote.terminate(false).await {
                        tracing::debug!(error = %e, "remote launcher could not be terminated");
                    }
                });
            }
            Err(_) => tracing::debug!("no runtime to relay the kill to the worker"),
        }
    }
}
