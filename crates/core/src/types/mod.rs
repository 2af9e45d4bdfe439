mod failure;
mod fork;
mod ids;
mod logs;
mod preview;
mod result;
mod script;

pub use failure::{FailureKind, TaskFailure};
pub use fork::ForkEnvironment;
pub use ids::{JobId, TaskId};
pub use logs::{LogEvent, LogStream, TaskLogs};
pub use preview::{
    register_previewer, resolve_previewer, Description, PreviewFactory, ResultPreview,
};
pub use result::{Payload, TaskResult};
pub use script::{ExecutionNode, Script, ScriptBindings, ScriptResult, ScriptSource};
