//! Pluggable renderers that turn a task result into something a human can read.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::types::TaskResult;

/// Rich rendering of a result for graphical clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Description {
    PlainText(String),
    Markup { media_type: String, body: String },
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Description::PlainText(text) => f.write_str(text),
            Description::Markup { body, .. } => f.write_str(body),
        }
    }
}

/// Renders a task result. Returning `None` falls back to the default rendering.
pub trait ResultPreview: Send + Sync + fmt::Debug {
    fn textual_description(&self, result: &TaskResult) -> Option<String>;

    fn graphical_description(&self, result: &TaskResult) -> Option<Description> {
        self.textual_description(result).map(Description::PlainText)
    }
}

pub type PreviewFactory = Arc<dyn Fn() -> Result<Arc<dyn ResultPreview>> + Send + Sync>;

static PREVIEWERS: Lazy<RwLock<HashMap<String, PreviewFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a previewer factory under `name`, replacing any previous one
pub fn register_previewer<F>(name: impl Into<String>, factory: F)
where
    F: Fn() -> Result<Arc<dyn ResultPreview>> + Send + Sync + 'static,
{
    PREVIEWERS.write().insert(name.into(), Arc::new(factory));
}

/// Instantiate the previewer registered under `name`
pub fn resolve_previewer(name: &str) -> Result<Arc<dyn ResultPreview>> {
    let factory = PREVIEWERS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::configuration(format!("no previewer registered as '{name}'")))?;
    factory()
}
