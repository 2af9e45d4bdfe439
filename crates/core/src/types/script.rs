use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Variables handed to a script in addition to the scheduler variables
pub type ScriptBindings = BTreeMap<String, String>;

/// Where the body of a script comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSource {
    Inline(String),
    File(PathBuf),
}

/// A user script run around a task (pre, post, generation or env script)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub source: ScriptSource,
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl Script {
    #[must_use]
    pub fn inline(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: ScriptSource::Inline(body.into()),
            arguments: Vec::new(),
        }
    }

    #[must_use]
    pub fn file(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source: ScriptSource::File(path.into()),
            arguments: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Outcome reported by the script facility
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    /// Value produced by the script, `None` when it produced nothing
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ScriptResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Node a script or task is executed on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub name: String,
    pub host: String,
}

impl ExecutionNode {
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
        }
    }
}
