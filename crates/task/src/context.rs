use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use tasklaunch_core::{ExecutionNode, LogStream, TaskId, TaskResult};

use crate::kill::{KillReason, KillSwitch};
use crate::logging::{LogSink, TaskWriter};

/// What a running task can see of its launcher
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    sink: LogSink,
    switch: KillSwitch,
    node: ExecutionNode,
    inherited: BTreeMap<String, String>,
    propagated: Arc<Mutex<BTreeMap<String, String>>>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        sink: LogSink,
        switch: KillSwitch,
        node: ExecutionNode,
        parents: &[TaskResult],
    ) -> Self {
        let mut inherited = BTreeMap::new();
        for parent in parents {
            inherited.extend(
                parent
                    .propagated_properties()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        Self {
            task_id,
            sink,
            switch,
            node,
            inherited,
            propagated: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    #[must_use]
    pub fn node(&self) -> &ExecutionNode {
        &self.node
    }

    pub(crate) fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// Writer for the task's standard output
    #[must_use]
    pub fn stdout(&self) -> TaskWriter {
        self.sink.writer(LogStream::Stdout)
    }

    /// Writer for the task's standard error
    #[must_use]
    pub fn stderr(&self) -> TaskWriter {
        self.sink.writer(LogStream::Stderr)
    }

    /// Write one line to the task's standard output
    pub fn log(&self, line: impl AsRef<str>) {
        let mut out = self.stdout();
        let _ = writeln!(out, "{}", line.as_ref());
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.switch.is_killed()
    }

    /// Resolves once the task is killed
    pub async fn killed(&self) -> KillReason {
        self.switch.killed().await
    }

    /// A property propagated by one of the parent tasks
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.inherited.get(key).map(String::as_str)
    }

    /// Export a property to the tasks that depend on this one
    pub fn propagate(&self, key: impl Into<String>, value: impl Into<String>) {
        self.propagated.lock().insert(key.into(), value.into());
    }

    #[must_use]
    pub fn propagated_properties(&self) -> BTreeMap<String, String> {
        self.propagated.lock().clone()
    }

    /// Scheduler variables followed by inherited properties, keyed by dotted name
    #[must_use]
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars: BTreeMap<String, String> = self
            .task_id
            .scheduler_variables()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        vars.extend(self.inherited.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}
