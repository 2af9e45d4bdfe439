//! Task execution core: launchers, walltime enforcement, log capture and the
//! forked worker runtime.
//!
//! A scheduler builds a [`TaskLauncher`] per task, hands it an
//! [`ExecutableContainer`] and the results of the task's parents, and gets a
//! [`TaskResult`](tasklaunch_core::TaskResult) back whatever happens.

pub mod builtins;
pub mod context;
pub mod executable;
pub mod forked_executable;
pub mod kill;
pub mod launcher;
pub mod logging;
pub mod protocol;
pub mod script;
pub mod worker;

pub use context::TaskContext;
pub use executable::{
    Executable, ExecutableContainer, ExecutableRegistry, ForkedJavaExecutableContainer,
    JavaExecutableContainer, NativeExecutableContainer, TaskArguments, TaskCode,
};
pub use forked_executable::ForkedJavaExecutable;
pub use kill::{CancelOutcome, KillReason, KillSwitch, KillTask, Killable};
pub use launcher::{
    convert_javaenv_name_to_sysenv, CompletionCallback, ForkedJavaTaskLauncher,
    JavaTaskLauncher, LauncherHandle, LauncherKind, LauncherServices, NativeTaskLauncher,
    TaskLauncher, TaskLauncherInitializer,
};
pub use logging::{FileAppender, LogAppender, LogScope, LogSink, StdAppender, TaskWriter};
pub use script::{local_node, ScriptRunner, ShellScriptRunner};
pub use worker::{run_worker, WorkerOptions};
