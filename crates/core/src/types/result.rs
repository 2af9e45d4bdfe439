use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::DEFAULT_DESCRIPTION_PREFIX;
use crate::errors::{Error, Result};
use crate::types::{
    resolve_previewer, Description, FailureKind, ResultPreview, TaskFailure, TaskId, TaskLogs,
};

/// What a task produced: a value, a failure, or nothing once cleaned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Value(Value),
    Failure(TaskFailure),
    Cleaned { had_exception: bool },
}

/// Outcome of one task execution.
///
/// A result carries either a value or a failure, never both. The owning
/// scheduler may [`clean`](TaskResult::clean) it once persisted; only the
/// identity and the success/failure flag survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    id: TaskId,
    payload: Payload,
    #[serde(default)]
    output: Option<TaskLogs>,
    #[serde(default)]
    previewer: Option<String>,
    #[serde(skip)]
    descriptor: OnceCell<Option<Arc<dyn ResultPreview>>>,
    #[serde(default)]
    task_duration: Option<Duration>,
    #[serde(default)]
    propagated_properties: BTreeMap<String, String>,
}

impl TaskResult {
    #[must_use]
    pub fn success(id: TaskId, value: Value, output: TaskLogs) -> Self {
        Self::with_payload(id, Payload::Value(value), output)
    }

    #[must_use]
    pub fn failure(id: TaskId, failure: TaskFailure, output: TaskLogs) -> Self {
        Self::with_payload(id, Payload::Failure(failure), output)
    }

    /// Build a result from a launcher outcome
    #[must_use]
    pub fn from_outcome(id: TaskId, outcome: Result<Value>, output: TaskLogs) -> Self {
        match outcome {
            Ok(value) => Self::success(id, value, output),
            Err(error) => Self::failure(id, TaskFailure::from(&error), output),
        }
    }

    fn with_payload(id: TaskId, payload: Payload, output: TaskLogs) -> Self {
        Self {
            id,
            payload,
            output: Some(output),
            previewer: None,
            descriptor: OnceCell::new(),
            task_duration: None,
            propagated_properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.task_duration = Some(duration);
        self
    }

    #[must_use]
    pub fn with_propagated_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.propagated_properties = properties;
        self
    }

    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.id
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn had_exception(&self) -> bool {
        match &self.payload {
            Payload::Value(_) => false,
            Payload::Failure(_) => true,
            Payload::Cleaned { had_exception } => *had_exception,
        }
    }

    /// The success value, or the stored failure
    pub fn value(&self) -> std::result::Result<&Value, TaskFailure> {
        match &self.payload {
            Payload::Value(value) => Ok(value),
            Payload::Failure(failure) => Err(failure.clone()),
            Payload::Cleaned { .. } => Err(TaskFailure::new(
                FailureKind::Cleaned,
                format!("result of task {} has been cleaned", self.id),
            )),
        }
    }

    #[must_use]
    pub fn exception(&self) -> Option<&TaskFailure> {
        match &self.payload {
            Payload::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    #[must_use]
    pub fn output(&self) -> Option<&TaskLogs> {
        self.output.as_ref()
    }

    /// Interleaved log text, empty once cleaned
    #[must_use]
    pub fn output_text(&self) -> String {
        self.output
            .as_ref()
            .map(|logs| logs.all_logs(false))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn task_duration(&self) -> Option<Duration> {
        self.task_duration
    }

    #[must_use]
    pub fn propagated_properties(&self) -> &BTreeMap<String, String> {
        &self.propagated_properties
    }

    #[must_use]
    pub fn is_cleaned(&self) -> bool {
        matches!(self.payload, Payload::Cleaned { .. })
    }

    /// Drop value and output, keeping identity. Idempotent.
    pub fn clean(&mut self) {
        if self.is_cleaned() {
            return;
        }
        self.payload = Payload::Cleaned {
            had_exception: self.had_exception(),
        };
        self.output = None;
        self.descriptor = OnceCell::new();
    }

    #[must_use]
    pub fn previewer(&self) -> Option<&str> {
        self.previewer.as_deref()
    }

    /// Assign the previewer name. A result's previewer cannot be changed once set.
    pub fn set_previewer(&mut self, name: impl Into<String>) -> Result<()> {
        if let Some(existing) = &self.previewer {
            return Err(Error::configuration(format!(
                "Previewer class cannot be changed (already set to '{existing}')"
            )));
        }
        self.previewer = Some(name.into());
        Ok(())
    }

    fn descriptor(&self) -> Option<&Arc<dyn ResultPreview>> {
        self.descriptor
            .get_or_init(|| {
                let name = self.previewer.as_deref()?;
                match resolve_previewer(name) {
                    Ok(preview) => Some(preview),
                    Err(e) => {
                        tracing::debug!(
                            previewer = name,
                            error = %e,
                            "falling back to default description"
                        );
                        None
                    }
                }
            })
            .as_ref()
    }

    #[must_use]
    pub fn textual_description(&self) -> String {
        self.descriptor()
            .and_then(|preview| preview.textual_description(self))
            .unwrap_or_else(|| self.default_description())
    }

    #[must_use]
    pub fn graphical_description(&self) -> Description {
        self.descriptor()
            .and_then(|preview| preview.graphical_description(self))
            .unwrap_or_else(|| Description::PlainText(self.default_description()))
    }

    fn default_description(&self) -> String {
        let body = match &self.payload {
            Payload::Value(value) => render_value(value),
            Payload::Failure(failure) => failure.trace(),
            Payload::Cleaned { .. } => format!("result of task {} has been cleaned", self.id),
        };
        format!("{DEFAULT_DESCRIPTION_PREFIX}{body}")
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Value(value) => f.write_str(&render_value(value)),
            Payload::Failure(failure) => write!(f, "{failure}"),
            Payload::Cleaned { .. } => write!(f, "<cleaned result of task {}>", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{register_previewer, JobId, LogEvent, LogStream};
    use serde_json::json;

    fn task_id() -> TaskId {
        TaskId::new(JobId::new(1, "job"), 1, "task")
    }

    fn logs(line: &str) -> TaskLogs {
        TaskLogs::new(vec![LogEvent::new(LogStream::Stdout, line)])
    }

    #[derive(Debug)]
    struct Shouting;

    impl ResultPreview for Shouting {
        fn textual_description(&self, result: &TaskResult) -> Option<String> {
            result.value().ok().map(|v| render_value(v).to_uppercase())
        }
    }

    #[derive(Debug)]
    struct Silent;

    impl ResultPreview for Silent {
        fn textual_description(&self, _result: &TaskResult) -> Option<String> {
            None
        }
    }

    #[test]
    fn success_and_failure_are_exclusive() {
        let ok = TaskResult::success(task_id(), json!("ok"), logs("hello"));
        assert!(!ok.had_exception());
        assert_eq!(ok.value().unwrap(), &json!("ok"));
        assert!(ok.exception().is_none());

        let failed = TaskResult::failure(task_id(), TaskFailure::user("boom"), logs("x"));
        assert!(failed.had_exception());
        assert_eq!(failed.value().unwrap_err().message(), "boom");
        assert!(failed.exception().is_some());
    }

    #[test]
    fn clean_is_idempotent_and_keeps_identity() {
        let mut result = TaskResult::failure(task_id(), TaskFailure::user("boom"), logs("x"));
        result.clean();
        let once = result.clone();
        result.clean();

        assert_eq!(result.payload(), once.payload());
        assert!(result.output().is_none());
        assert_eq!(result.output_text(), "");
        assert_eq!(result.task_id(), &task_id());
        assert!(result.had_exception());
        assert_eq!(result.value().unwrap_err().kind(), FailureKind::Cleaned);
    }

    #[test]
    fn previewer_cannot_be_reassigned() {
        let mut result = TaskResult::success(task_id(), json!(1), TaskLogs::default());
        result.set_previewer("first").unwrap();
        let err = result.set_previewer("second").unwrap_err();
        assert!(err.to_string().contains("cannot be changed"));
        assert_eq!(result.previewer(), Some("first"));
    }

    #[test]
    fn descriptions_fall_back_on_resolution_failure() {
        let mut result = TaskResult::success(task_id(), json!("plain"), TaskLogs::default());
        assert_eq!(result.textual_description(), "[DEFAULT DESCRIPTION] plain");

        result.set_previewer("not-registered").unwrap();
        assert_eq!(result.textual_description(), "[DEFAULT DESCRIPTION] plain");
        assert_eq!(
            result.graphical_description(),
            Description::PlainText("[DEFAULT DESCRIPTION] plain".into())
        );
    }

    #[test]
    fn registered_previewer_is_used() {
        register_previewer("result-tests-shouting", || Ok(Arc::new(Shouting) as _));
        register_previewer("result-tests-silent", || Ok(Arc::new(Silent) as _));
        register_previewer("result-tests-broken", || {
            Err(Error::configuration("cannot instantiate"))
        });

        let mut shouted = TaskResult::success(task_id(), json!("quiet"), TaskLogs::default());
        shouted.set_previewer("result-tests-shouting").unwrap();
        assert_eq!(shouted.textual_description(), "QUIET");
        assert_eq!(shouted.graphical_description(), Description::PlainText("QUIET".into()));

        for name in ["result-tests-silent", "result-tests-broken"] {
            let mut result = TaskResult::success(task_id(), json!(42), TaskLogs::default());
            result.set_previewer(name).unwrap();
            assert_eq!(result.textual_description(), "[DEFAULT DESCRIPTION] 42");
        }
    }

    #[test]
    fn failure_description_includes_causes() {
        let failure = TaskFailure::user("outer").with_cause("inner");
        let result = TaskResult::failure(task_id(), failure, TaskLogs::default());
        let text = result.textual_description();
        assert!(text.starts_with("[DEFAULT DESCRIPTION] outer"));
        assert!(text.contains("caused by: inner"));
    }

    #[test]
    fn survives_serialization() {
        let mut properties = BTreeMap::new();
        properties.insert("k".to_string(), "v".to_string());
        let result = TaskResult::success(task_id(), json!({"n": 1}), logs("line"))
            .with_duration(Duration::from_millis(5))
            .with_propagated_properties(properties);

        let wire = serde_json::to_string(&result).unwrap();
        let back: TaskResult = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.value().unwrap(), &json!({"n": 1}));
        assert_eq!(back.output_text(), "line\n");
        assert_eq!(back.task_duration(), Some(Duration::from_millis(5)));
        assert_eq!(back.propagated_properties().get("k").map(String::as_str), Some("v"));
    }

    proptest::proptest! {
        #[test]
        fn exactly_one_payload_slot(message in ".*", is_failure in proptest::bool::ANY) {
            let result = if is_failure {
                TaskResult::failure(task_id(), TaskFailure::user(message), TaskLogs::default())
            } else {
                TaskResult::success(task_id(), Value::String(message), TaskLogs::default())
            };
            proptest::prop_assert_eq!(result.had_exception(), result.value().is_err());
            proptest::prop_assert_eq!(result.had_exception(), result.exception().is_some());
        }
    }
}
