//! Task launchers.
//!
//! A [`TaskLauncher`] runs exactly one task and always returns a
//! [`TaskResult`]. The launch protocol is shared; what "execute" means is
//! decided by one of three strategies:
//!
//! - [`JavaTaskLauncher`] runs task code in this process,
//! - [`NativeTaskLauncher`] runs an external command,
//! - [`ForkedJavaTaskLauncher`] runs task code in a dedicated worker process.
//!
//! Protocol of [`TaskLauncher::do_task`]:
//!
//! 1. open the task's log scope,
//! 2. run the pre-script, a failure aborts the task,
//! 3. arm the walltime timer, execute, disarm the timer,
//! 4. run the post-script with a `success` binding,
//! 5. finalize the strategy (reclaim child processes),
//! 6. package value or failure with the captured log,
//! 7. notify the completion callback unless the launcher was aborted.

mod forked;
mod java;
mod native;

pub use forked::ForkedJavaTaskLauncher;
pub use java::JavaTaskLauncher;
pub use native::{convert_javaenv_name_to_sysenv, NativeTaskLauncher};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

use tasklaunch_config::LauncherConfig;
use tasklaunch_core::{
    Error, ExecutionNode, LogStream, Result, Script, ScriptBindings, ScriptResult, TaskId,
    TaskLogs, TaskResult, SUCCESS_BINDING,
};
use tasklaunch_utils::tracing::{task_completed, task_span};

use crate::context::TaskContext;
use crate::executable::{ExecutableContainer, ExecutableRegistry};
use crate::kill::{CancelOutcome, KillReason, KillSwitch, KillTask, Killable};
use crate::logging::{FileAppender, LogAppender, LogScope, LogSink};
use crate::protocol::RegistrationHub;
use crate::script::{local_node, ScriptRunner, ShellScriptRunner};

/// Name of the node tasks run on when the scheduler names none
pub const LOCAL_NODE_NAME: &str = "local-node";

/// Scheduler-side hook told when a launcher is done with its task
#[async_trait]
pub trait CompletionCallback: Send + Sync {
    async fn notify_task_finished(&self, task_id: &TaskId);
}

/// Per-task launcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLauncherInitializer {
    pub task_id: TaskId,
    #[serde(default)]
    pub pre_script: Option<Script>,
    #[serde(default)]
    pub post_script: Option<Script>,
    #[serde(default)]
    pub walltime: Option<Duration>,
    /// Node scripts and the task run on
    #[serde(default)]
    pub node: Option<ExecutionNode>,
}

impl TaskLauncherInitializer {
    #[must_use]
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            pre_script: None,
            post_script: None,
            walltime: None,
            node: None,
        }
    }

    #[must_use]
    pub fn with_pre_script(mut self, script: Script) -> Self {
        self.pre_script = Some(script);
        self
    }

    #[must_use]
    pub fn with_post_script(mut self, script: Script) -> Self {
        self.post_script = Some(script);
        self
    }

    #[must_use]
    pub fn with_walltime(mut self, walltime: Duration) -> Self {
        self.walltime = Some(walltime);
        self
    }

    #[must_use]
    pub fn with_node(mut self, node: ExecutionNode) -> Self {
        self.node = Some(node);
        self
    }
}

/// Collaborators shared by launchers
#[derive(Clone)]
pub struct LauncherServices {
    config: Arc<LauncherConfig>,
    scripts: Arc<dyn ScriptRunner>,
    registry: ExecutableRegistry,
    hub: Arc<tokio::sync::OnceCell<Arc<RegistrationHub>>>,
}

impl LauncherServices {
    /// Shell script runner and the builtin executables
    #[must_use]
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            scripts: Arc::new(ShellScriptRunner::new(config.shell.clone())),
            config: Arc::new(config),
            registry: ExecutableRegistry::with_builtins(),
            hub: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    #[must_use]
    pub fn with_script_runner(mut self, scripts: Arc<dyn ScriptRunner>) -> Self {
        self.scripts = scripts;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ExecutableRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_hub(mut self, hub: Arc<RegistrationHub>) -> Self {
        self.hub = Arc::new(tokio::sync::OnceCell::new_with(Some(hub)));
        self
    }

    #[must_use]
    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    #[must_use]
    pub fn scripts(&self) -> &dyn ScriptRunner {
        self.scripts.as_ref()
    }

    #[must_use]
    pub fn registry(&self) -> &ExecutableRegistry {
        &self.registry
    }

    /// The registration hub, bound on first use
    pub async fn hub(&self) -> Result<Arc<RegistrationHub>> {
        self.hub
            .get_or_try_init(|| RegistrationHub::bind(&self.config.worker))
            .await
            .map(Arc::clone)
    }
}

impl Default for LauncherServices {
    fn default() -> Self {
        Self::new(LauncherConfig::default())
    }
}

/// Which execution strategy a launcher uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    Java,
    Native,
    ForkedJava,
}

impl LauncherKind {
    /// The strategy a scheduler picks for a container
    #[must_use]
    pub fn for_container(container: &ExecutableContainer) -> Self {
        match container {
            ExecutableContainer::Java(_) => LauncherKind::Java,
            ExecutableContainer::Native(_) => LauncherKind::Native,
            ExecutableContainer::ForkedJava(_) => LauncherKind::ForkedJava,
        }
    }
}

/// Everything a strategy sees of the launch in progress
pub(crate) struct Launch<'a> {
    pub initializer: &'a TaskLauncherInitializer,
    pub services: &'a LauncherServices,
    pub context: &'a TaskContext,
    pub parents: &'a [TaskResult],
}

impl Launch<'_> {
    pub fn kill_error(&self, reason: KillReason) -> Error {
        reason.into_error(&self.initializer.task_id, self.initializer.walltime)
    }

    /// Bound `future` by the task's kill switch. The future is dropped on kill.
    pub async fn unless_killed<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            reason = self.context.killed() => Err(self.kill_error(reason)),
            outcome = future => outcome,
        }
    }
}

#[async_trait]
pub(crate) trait LaunchStrategy: Send {
    fn name(&self) -> &'static str;

    /// Whether pre- and post-scripts run in this process
    fn runs_scripts_locally(&self) -> bool {
        true
    }

    /// What the walltime timer and aborts kill
    fn kill_target(&self) -> Arc<dyn Killable>;

    async fn execute(&mut self, launch: &Launch<'_>, container: ExecutableContainer)
        -> Result<Value>;

    /// Reclaim resources. Must be idempotent.
    async fn finalize(&mut self, _services: &LauncherServices) {}
}

enum LauncherVariant {
    Java(JavaTaskLauncher),
    Native(NativeTaskLauncher),
    ForkedJava(ForkedJavaTaskLauncher),
}

impl LauncherVariant {
    fn strategy(&mut self) -> &mut dyn LaunchStrategy {
        match self {
            LauncherVariant::Java(java) => java,
            LauncherVariant::Native(native) => native,
            LauncherVariant::ForkedJava(forked) => forked,
        }
    }

    fn kind(&self) -> LauncherKind {
        match self {
            LauncherVariant::Java(_) => LauncherKind::Java,
            LauncherVariant::Native(_) => LauncherKind::Native,
            LauncherVariant::ForkedJava(_) => LauncherKind::ForkedJava,
        }
    }
}

struct LauncherShared {
    switch: KillSwitch,
    sink: LogSink,
    kill_target: Arc<dyn Killable>,
    has_been_killed: AtomicBool,
}

/// Cloneable handle for terminating a launcher and reading its logs
/// while `do_task` runs elsewhere
#[derive(Clone)]
pub struct LauncherHandle {
    task_id: TaskId,
    shared: Arc<LauncherShared>,
}

impl LauncherHandle {
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Abnormal termination aborts the running task; its launcher then
    /// skips the completion callback.
    pub fn terminate(&self, normal: bool) {
        if normal {
            tracing::debug!(task_id = %self.task_id, "launcher terminated normally");
            return;
        }
        tracing::info!(task_id = %self.task_id, "aborting task");
        self.shared.has_been_killed.store(true, Ordering::SeqCst);
        self.shared.kill_target.kill(KillReason::Aborted);
    }

    #[must_use]
    pub fn has_been_killed(&self) -> bool {
        self.shared.has_been_killed.load(Ordering::SeqCst)
    }

    /// Output captured so far
    #[must_use]
    pub fn logs(&self) -> TaskLogs {
        self.shared.sink.snapshot()
    }

    /// Attach an appender, replaying what was captured before it
    pub fn activate_logs(&self, appender: Arc<dyn LogAppender>) {
        self.shared.sink.activate(appender);
    }
}

/// Runs one task and packages its outcome
pub struct TaskLauncher {
    initializer: TaskLauncherInitializer,
    services: LauncherServices,
    variant: LauncherVariant,
    shared: Arc<LauncherShared>,
    used: bool,
}

impl TaskLauncher {
    #[must_use]
    pub fn new(
        kind: LauncherKind,
        initializer: TaskLauncherInitializer,
        services: LauncherServices,
    ) -> Self {
        let switch = KillSwitch::new();
        let sink = LogSink::new(services.config().max_log_events);
        if let Some(dir) = &services.config().log_dir {
            let path = dir.join(format!("{}.log", initializer.task_id.value()));
            match FileAppender::create(&path) {
                Ok(appender) => sink.add_appender(Arc::new(appender)),
                Err(e) => tracing::warn!(error = %e, "task log will not be mirrored to disk"),
            }
        }

        let variant = match kind {
            LauncherKind::Java => LauncherVariant::Java(JavaTaskLauncher::new(switch.clone())),
            LauncherKind::Native => {
                LauncherVariant::Native(NativeTaskLauncher::new(switch.clone()))
            }
            LauncherKind::ForkedJava => {
                LauncherVariant::ForkedJava(ForkedJavaTaskLauncher::new(switch.clone()))
            }
        };
        let kill_target = match &variant {
            LauncherVariant::Java(java) => java.kill_target(),
            LauncherVariant::Native(native) => native.kill_target(),
            LauncherVariant::ForkedJava(forked) => forked.kill_target(),
        };

        Self {
            initializer,
            services,
            variant,
            shared: Arc::new(LauncherShared {
                switch,
                sink,
                kill_target,
                has_been_killed: AtomicBool::new(false),
            }),
            used: false,
        }
    }

    #[must_use]
    pub fn java(initializer: TaskLauncherInitializer, services: LauncherServices) -> Self {
        Self::new(LauncherKind::Java, initializer, services)
    }

    #[must_use]
    pub fn native(initializer: TaskLauncherInitializer, services: LauncherServices) -> Self {
        Self::new(LauncherKind::Native, initializer, services)
    }

    #[must_use]
    pub fn forked_java(initializer: TaskLauncherInitializer, services: LauncherServices) -> Self {
        Self::new(LauncherKind::ForkedJava, initializer, services)
    }

    /// Launcher of the kind the container calls for
    #[must_use]
    pub fn for_container(
        container: &ExecutableContainer,
        initializer: TaskLauncherInitializer,
        services: LauncherServices,
    ) -> Self {
        Self::new(LauncherKind::for_container(container), initializer, services)
    }

    #[must_use]
    pub fn kind(&self) -> LauncherKind {
        self.variant.kind()
    }

    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.initializer.task_id
    }

    #[must_use]
    pub fn handle(&self) -> LauncherHandle {
        LauncherHandle {
            task_id: self.initializer.task_id.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    #[must_use]
    pub fn logs(&self) -> TaskLogs {
        self.shared.sink.snapshot()
    }

    pub fn activate_logs(&self, appender: Arc<dyn LogAppender>) {
        self.shared.sink.activate(appender);
    }

    /// Run the task. Never fails: every failure ends up in the result.
    pub async fn do_task(
        &mut self,
        callback: Option<Arc<dyn CompletionCallback>>,
        container: ExecutableContainer,
        parents: &[TaskResult],
    ) -> TaskResult {
        let span = task_span(
            &self.initializer.task_id.value(),
            self.variant.strategy().name(),
        );
        self.run(callback, container, parents).instrument(span).await
    }

    async fn run(
        &mut self,
        callback: Option<Arc<dyn CompletionCallback>>,
        container: ExecutableContainer,
        parents: &[TaskResult],
    ) -> TaskResult {
        let started = Instant::now();
        let task_id = self.initializer.task_id.clone();
        if std::mem::replace(&mut self.used, true) {
            tracing::warn!("launcher reused, task is not run");
            let error = Error::configuration(format!(
                "launcher of task {task_id} has already run its task"
            ));
            return TaskResult::from_outcome(task_id, Err(error), TaskLogs::default());
        }
        let scope = LogScope::open(self.shared.sink.clone());
        let node = self
            .initializer
            .node
            .clone()
            .unwrap_or_else(|| local_node(LOCAL_NODE_NAME));
        let context = TaskContext::new(
            task_id.clone(),
            self.shared.sink.clone(),
            self.shared.switch.clone(),
            node,
            parents,
        );

        let launch = Launch {
            initializer: &self.initializer,
            services: &self.services,
            context: &context,
            parents,
        };
        let phases = run_phases(self.variant.strategy(), &launch, container, &self.shared);
        let outcome = AssertUnwindSafe(phases)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::execution(format!(
                    "task panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        self.variant.strategy().finalize(&self.services).await;

        let duration = started.elapsed();
        if let Err(e) = &outcome {
            tracing::debug!(error = %e, "task ended with a failure");
        }
        task_completed(
            &task_id.value(),
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            outcome.is_ok(),
        );

        let logs = scope.finish();
        let result = TaskResult::from_outcome(task_id.clone(), outcome, logs)
            .with_duration(duration)
            .with_propagated_properties(context.propagated_properties());

        if self.shared.has_been_killed.load(Ordering::SeqCst) {
            tracing::debug!("launcher was aborted, completion is not reported");
        } else if let Some(callback) = callback {
            callback.notify_task_finished(&task_id).await;
        }
        result
    }

    /// Reclaim whatever the launcher still holds
    pub async fn terminate(mut self) {
        self.variant.strategy().finalize(&self.services).await;
        self.shared.sink.close();
    }
}

async fn run_phases(
    strategy: &mut dyn LaunchStrategy,
    launch: &Launch<'_>,
    container: ExecutableContainer,
    shared: &LauncherShared,
) -> Result<Value> {
    let local_scripts = strategy.runs_scripts_locally();
    if local_scripts {
        if let Some(script) = &launch.initializer.pre_script {
            let result = run_script(launch, script, "Pre-script", ScriptBindings::new()).await?;
            if let Some(error) = result.error {
                return Err(Error::script(
                    "Pre-script",
                    format!("{error} (on node {})", launch.context.node().name),
                ));
            }
        }
    }

    let timer = launch.initializer.walltime.map(|walltime| {
        let timer = KillTask::new(Arc::clone(&shared.kill_target), walltime);
        timer.schedule();
        timer
    });
    let mut outcome = strategy.execute(launch, container).await;
    if let Some(timer) = timer {
        if timer.cancel() == CancelOutcome::AlreadyFired {
            tracing::debug!("walltime fired before the executable returned");
        }
    }
    if let (Ok(_), Some(reason)) = (&outcome, shared.switch.reason()) {
        outcome = Err(launch.kill_error(reason));
    }

    if local_scripts && !shared.switch.is_killed() {
        if let Some(script) = &launch.initializer.post_script {
            let mut bindings = ScriptBindings::new();
            bindings.insert(SUCCESS_BINDING.to_string(), outcome.is_ok().to_string());
            match run_script(launch, script, "Post-script", bindings).await {
                Ok(ScriptResult { error: Some(error), .. }) => {
                    outcome = Err(Error::script("Post-script", error));
                }
                Ok(_) => {}
                Err(e) => outcome = Err(e),
            }
        }
    }
    outcome
}

/// Run a user script on the task's node, copying its output into the task log.
///
/// Scheduler variables and inherited properties are added to `bindings`.
pub(crate) async fn run_script(
    launch: &Launch<'_>,
    script: &Script,
    role: &str,
    mut bindings: ScriptBindings,
) -> Result<ScriptResult> {
    for (key, value) in launch.context.variables() {
        bindings.entry(key).or_insert(value);
    }
    let result = launch
        .services
        .scripts()
        .run_script(script, Some(launch.context.node()), &bindings)
        .await
        .map_err(|e| Error::script(role, e.to_string()))?;

    let sink = launch.context.sink();
    for line in result.stdout.lines() {
        sink.push(LogStream::Stdout, line);
    }
    for line in result.stderr.lines() {
        sink.push(LogStream::Stderr, line);
    }
    Ok(result)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
