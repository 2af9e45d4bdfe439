use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use tasklaunch_core::{Error, Result};

use super::{Launch, LaunchStrategy};
use crate::executable::{ExecutableContainer, JavaExecutableContainer};
use crate::kill::{KillSwitch, Killable};

/// Runs task code in the launcher's own process.
///
/// Killing flips the shared switch: the running code is dropped at its next
/// await point, and cooperative code can watch
/// [`TaskContext::killed`](crate::context::TaskContext::killed).
pub struct JavaTaskLauncher {
    switch: KillSwitch,
}

impl JavaTaskLauncher {
    pub(crate) fn new(switch: KillSwitch) -> Self {
        Self { switch }
    }

    async fn run_in_process(
        &self,
        launch: &Launch<'_>,
        container: JavaExecutableContainer,
    ) -> Result<Value> {
        let (mut executable, arguments) = container.instantiate(launch.services.registry())?;
        let run = async {
            executable.init(&arguments).await?;
            executable.execute(launch.context, launch.parents).await
        };
        tokio::select! {
            biased;
            reason = self.switch.killed() => Err(launch.kill_error(reason)),
            outcome = run => outcome,
        }
    }
}

#[async_trait]
impl LaunchStrategy for JavaTaskLauncher {
    fn name(&self) -> &'static str {
        "java"
    }

    fn kill_target(&self) -> Arc<dyn Killable> {
        Arc::new(self.switch.clone())
    }

    async fn execute(
        &mut self,
        launch: &Launch<'_>,
        container: ExecutableContainer,
    ) -> Result<Value> {
        let container = match container {
            ExecutableContainer::Java(container) => container,
            // Forked task code can always run in-process
            ExecutableContainer::ForkedJava(forked) => JavaExecutableContainer {
                code: crate::executable::TaskCode::Named(forked.executable),
                arguments: forked.arguments,
            },
            other => {
                return Err(Error::configuration(format!(
                    "java launcher cannot run a {} executable",
                    other.kind()
                )))
            }
        };
        self.run_in_process(launch, container).await
    }
}
