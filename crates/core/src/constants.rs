/// Constants used throughout the tasklaunch codebase
use std::time::Duration;

// Scheduler variables exposed to every task
pub const JOB_ID_PROPERTY: &str = "scheduler.job.id";
pub const JOB_NAME_PROPERTY: &str = "scheduler.job.name";
pub const TASK_ID_PROPERTY: &str = "scheduler.task.id";
pub const TASK_NAME_PROPERTY: &str = "scheduler.task.name";

// Result rendering
pub const DEFAULT_DESCRIPTION_PREFIX: &str = "[DEFAULT DESCRIPTION] ";

// Binding handed to post-scripts
pub const SUCCESS_BINDING: &str = "success";

// Forked worker handshake
pub const DEFAULT_REGISTRATION_ATTEMPTS: u32 = 10;
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STREAM_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(21);
pub const SESSION_ID_BOUND: u32 = 1_000_000;
pub const WORKER_NODE_COUNT: u32 = 1;
pub const FORKED_NODE_PREFIX: &str = "forked-task-node-";
pub const WORKER_BINARY: &str = "tasklaunch-worker";

// Log storage
pub const DEFAULT_MAX_LOG_EVENTS: usize = 10_000;

// Default shell for scripts
pub const DEFAULT_SHELL: &str = "sh";
