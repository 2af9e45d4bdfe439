use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which stream of the task a log line was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A single captured line of task output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub stream: LogStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    #[must_use]
    pub fn new(stream: LogStream, line: impl Into<String>) -> Self {
        Self {
            stream,
            line: line.into(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn render(&self, timestamps: bool) -> String {
        if timestamps {
            format!("[{}] {}", self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"), self.line)
        } else {
            self.line.clone()
        }
    }
}

/// Immutable log buffer attached to a task result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogs {
    events: Vec<LogEvent>,
}

impl TaskLogs {
    #[must_use]
    pub fn new(events: Vec<LogEvent>) -> Self {
        Self { events }
    }

    #[must_use]
    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Both streams interleaved in arrival order
    #[must_use]
    pub fn all_logs(&self, timestamps: bool) -> String {
        self.render(None, timestamps)
    }

    #[must_use]
    pub fn stdout_logs(&self, timestamps: bool) -> String {
        self.render(Some(LogStream::Stdout), timestamps)
    }

    #[must_use]
    pub fn stderr_logs(&self, timestamps: bool) -> String {
        self.render(Some(LogStream::Stderr), timestamps)
    }

    fn render(&self, stream: Option<LogStream>, timestamps: bool) -> String {
        let mut out = String::new();
        for event in &self.events {
            if stream.is_some_and(|s| s != event.stream) {
                continue;
            }
            out.push_str(&event.render(timestamps));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_by_stream() {
        let logs = TaskLogs::new(vec![
            LogEvent::new(LogStream::Stdout, "out 1"),
            LogEvent::new(LogStream::Stderr, "err 1"),
            LogEvent::new(LogStream::Stdout, "out 2"),
        ]);
        assert_eq!(logs.all_logs(false), "out 1\nerr 1\nout 2\n");
        assert_eq!(logs.stdout_logs(false), "out 1\nout 2\n");
        assert_eq!(logs.stderr_logs(false), "err 1\n");
        assert!(logs.all_logs(true).starts_with('['));
    }
}
