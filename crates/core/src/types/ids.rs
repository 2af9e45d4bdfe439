use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{JOB_ID_PROPERTY, JOB_NAME_PROPERTY, TASK_ID_PROPERTY, TASK_NAME_PROPERTY};

/// Identity of a submitted job
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    id: u64,
    name: String,
}

impl JobId {
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Identity of one task instance inside a job.
///
/// The rendered value concatenates the job id with the task index padded to
/// four digits, so task 1 of job 1 is `10001`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    job: JobId,
    id: u32,
    name: String,
}

impl TaskId {
    #[must_use]
    pub fn new(job: JobId, id: u32, name: impl Into<String>) -> Self {
        Self {
            job,
            id,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn job(&self) -> &JobId {
        &self.job
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn value(&self) -> String {
        format!("{}{:04}", self.job.id, self.id)
    }

    #[must_use]
    pub fn readable_name(&self) -> String {
        format!("{} ({})", self.name, self.value())
    }

    /// Scheduler variables describing this task, keyed by property name
    #[must_use]
    pub fn scheduler_variables(&self) -> Vec<(&'static str, String)> {
        vec![
            (JOB_ID_PROPERTY, self.job.id.to_string()),
            (JOB_NAME_PROPERTY, self.job.name.clone()),
            (TASK_ID_PROPERTY, self.value()),
            (TASK_NAME_PROPERTY, self.name.clone()),
        ]
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value())
    }
}
