use std::path::PathBuf;
use std::time::Duration;

use crate::types::TaskFailure;

/// Result type alias for tasklaunch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tasklaunch operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// Command execution errors
    #[error("{}", format_command_error(.command, .args, .message, .exit_code))]
    CommandExecution {
        command: String,
        args: Vec<String>,
        message: String,
        exit_code: Option<i32>,
    },

    /// A pre-, post-, generation or environment script failed
    #[error("{script} has failed: {message}")]
    Script { script: String, message: String },

    /// The task ran past its walltime and was killed
    #[error("Walltime of {} ms reached on task {task}", .walltime.as_millis())]
    WalltimeExceeded { task: String, walltime: Duration },

    /// The task was aborted on request of the scheduler
    #[error("Task {task} has been killed")]
    TaskAborted { task: String },

    /// The dedicated worker process could not be brought up
    #[error("could not create worker process: {message}")]
    WorkerSpawn { message: String },

    /// A native process could not be started
    #[error("failed to start process '{command}': {source}")]
    ProcessStart {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Parent/worker wire protocol errors
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Operation timeout errors
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// The task body itself failed
    #[error("{message}")]
    Execution { message: String },

    /// A failure reported by another launcher, carried unchanged
    #[error(transparent)]
    Task(#[from] TaskFailure),
}

fn format_command_error(
    command: &str,
    args: &[String],
    message: &str,
    exit_code: &Option<i32>,
) -> String {
    let args_str = args.join(" ");
    let display = if args_str.is_empty() {
        command.to_string()
    } else {
        format!("{command} {args_str}")
    };
    match exit_code {
        Some(code) => format!("command '{display}' failed with exit code {code}: {message}"),
        None => format!("command '{display}' failed: {message}"),
    }
}

// Conversion implementations
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::FileSystem {
            path: PathBuf::new(),
            operation: "unknown".to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Execution {
            message: format!("{error:#}"),
        }
    }
}

// Helper methods for creating errors with context
impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a command execution error
    #[must_use]
    pub fn command_execution(
        command: impl Into<String>,
        args: Vec<String>,
        message: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Error::CommandExecution {
            command: command.into(),
            args,
            message: message.into(),
            exit_code,
        }
    }

    /// Create a script failure, `script` names the role ("Pre-script", "Env-script", ...)
    #[must_use]
    pub fn script(script: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Script {
            script: script.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn walltime_exceeded(task: impl Into<String>, walltime: Duration) -> Self {
        Error::WalltimeExceeded {
            task: task.into(),
            walltime,
        }
    }

    #[must_use]
    pub fn task_aborted(task: impl Into<String>) -> Self {
        Error::TaskAborted { task: task.into() }
    }

    /// Create a worker spawn error
    #[must_use]
    pub fn worker_spawn(message: impl Into<String>) -> Self {
        Error::WorkerSpawn {
            message: message.into(),
        }
    }

    /// Create a process start error
    #[must_use]
    pub fn process_start(command: impl Into<String>, source: std::io::Error) -> Self {
        Error::ProcessStart {
            command: command.into(),
            source,
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a task body failure
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Error::Execution {
            message: message.into(),
        }
    }

    /// Whether this error was raised by the walltime kill path
    #[must_use]
    pub fn is_walltime(&self) -> bool {
        match self {
            Error::WalltimeExceeded { .. } => true,
            Error::Task(failure) => failure.kind() == crate::types::FailureKind::WalltimeExceeded,
            _ => false,
        }
    }
}

// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a lazy message
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let base_error = e.into();
            Error::Configuration {
                message: format!("{}: {}", message.into(), base_error),
            }
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let base_error = e.into();
            Error::Configuration {
                message: format!("{}: {}", f(), base_error),
            }
        })
    }
}
