use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::Script;

/// How the dedicated worker process of a forked task is started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkEnvironment {
    /// Worker binary; the configured default is used when unset
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
    /// Arguments placed before the registration arguments
    #[serde(default)]
    pub worker_arguments: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the worker process
    #[serde(default)]
    pub system_environment: BTreeMap<String, String>,
    /// Run locally before forking; `KEY=VALUE` lines of its result join the environment
    #[serde(default)]
    pub env_script: Option<Script>,
}

impl ForkEnvironment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    #[must_use]
    pub fn with_worker_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.system_environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_env_script(mut self, script: Script) -> Self {
        self.env_script = Some(script);
        self
    }
}
