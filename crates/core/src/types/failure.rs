use serde::{Deserialize, Serialize};
use std::error::Error as StdError;

use crate::errors::Error;

/// Classification of a failed task, used by schedulers for retry and accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task body raised an error
    UserTask,
    /// A pre-, post-, generation or env script failed
    Script,
    WalltimeExceeded,
    Aborted,
    /// The forked worker could not be started or never registered
    WorkerSpawn,
    /// A native process could not be started
    ProcessStart,
    Internal,
    /// The result payload was dropped by its owner
    Cleaned,
}

/// Serialisable failure cause carried inside a `TaskResult`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    kind: FailureKind,
    message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    causes: Vec<String>,
}

impl TaskFailure {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// A failure raised by user task logic
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UserTask, message)
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn causes(&self) -> &[String] {
        &self.causes
    }

    /// Message followed by every cause, one per line
    #[must_use]
    pub fn trace(&self) -> String {
        let mut out = self.message.clone();
        for cause in &self.causes {
            out.push_str("\ncaused by: ");
            out.push_str(cause);
        }
        out
    }
}

impl From<&Error> for TaskFailure {
    fn from(error: &Error) -> Self {
        if let Error::Task(failure) = error {
            return failure.clone();
        }
        let kind = match error {
            Error::Script { .. } => FailureKind::Script,
            Error::WalltimeExceeded { .. } => FailureKind::WalltimeExceeded,
            Error::TaskAborted { .. } => FailureKind::Aborted,
            Error::WorkerSpawn { .. } => FailureKind::WorkerSpawn,
            Error::ProcessStart { .. } => FailureKind::ProcessStart,
            Error::Execution { .. } => FailureKind::UserTask,
            _ => FailureKind::Internal,
        };
        let mut failure = Self::new(kind, error.to_string());
        let mut source = error.source();
        while let Some(cause) = source {
            failure.causes.push(cause.to_string());
            source = cause.source();
        }
        failure
    }
}

impl From<Error> for TaskFailure {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn classifies_launcher_errors() {
        let cases = [
            (Error::script("Pre-script", "exit 1"), FailureKind::Script),
            (
                Error::walltime_exceeded("1", Duration::from_secs(1)),
                FailureKind::WalltimeExceeded,
            ),
            (Error::task_aborted("1"), FailureKind::Aborted),
            (Error::worker_spawn("gone"), FailureKind::WorkerSpawn),
            (Error::execution("boom"), FailureKind::UserTask),
            (Error::protocol("bad frame"), FailureKind::Internal),
        ];
        for (error, kind) in cases {
            assert_eq!(TaskFailure::from(&error).kind(), kind, "{error}");
        }
    }

    #[test]
    fn keeps_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let failure = TaskFailure::from(Error::process_start("missing-bin", io));
        assert_eq!(failure.kind(), FailureKind::ProcessStart);
        assert_eq!(failure.causes(), ["no such file"]);
        assert!(failure.trace().contains("caused by: no such file"));
    }

    #[test]
    fn remote_failures_pass_through() {
        let remote = TaskFailure::new(FailureKind::WalltimeExceeded, "late");
        let error = Error::from(remote.clone());
        assert!(error.is_walltime());
        assert_eq!(TaskFailure::from(&error), remote);
    }
}
