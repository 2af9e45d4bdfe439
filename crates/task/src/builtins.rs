//! Executables available to every worker by name.

use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::time::Duration;

use tasklaunch_core::{Error, Result, TaskResult};

use crate::context::TaskContext;
use crate::executable::{Executable, ExecutableRegistry, TaskArguments};

pub const ECHO: &str = "echo";
pub const SLEEP: &str = "sleep";
pub const FAIL: &str = "fail";
pub const PROPAGATE: &str = "propagate";

pub(crate) fn register(registry: &ExecutableRegistry) {
    registry.register(ECHO, || Box::<Echo>::default());
    registry.register(SLEEP, || Box::<Sleep>::default());
    registry.register(FAIL, || Box::<Fail>::default());
    registry.register(PROPAGATE, || Box::<Propagate>::default());
}

fn string_argument(arguments: &TaskArguments, key: &str) -> Option<String> {
    arguments.get(key).map(|value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Logs `message` and returns it
#[derive(Default)]
struct Echo {
    message: String,
}

#[async_trait]
impl Executable for Echo {
    async fn init(&mut self, arguments: &TaskArguments) -> Result<()> {
        self.message = string_argument(arguments, "message").unwrap_or_default();
        Ok(())
    }

    async fn execute(&mut self, context: &TaskContext, _parents: &[TaskResult]) -> Result<Value> {
        context.log(&self.message);
        Ok(Value::String(self.message.clone()))
    }
}

/// Waits `millis` milliseconds, or until killed
#[derive(Default)]
struct Sleep {
    duration: Duration,
}

#[async_trait]
impl Executable for Sleep {
    async fn init(&mut self, arguments: &TaskArguments) -> Result<()> {
        let millis = arguments
            .get("millis")
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| Error::configuration("'millis' must be a non-negative integer"))
            })
            .transpose()?
            .unwrap_or(0);
        self.duration = Duration::from_millis(millis);
        Ok(())
    }

    async fn execute(&mut self, context: &TaskContext, _parents: &[TaskResult]) -> Result<Value> {
        tokio::select! {
            () = tokio::time::sleep(self.duration) => {}
            _ = context.killed() => {}
        }
        Ok(Value::from(u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)))
    }
}

/// Fails with `message`
#[derive(Default)]
struct Fail {
    message: String,
}

#[async_trait]
impl Executable for Fail {
    async fn init(&mut self, arguments: &TaskArguments) -> Result<()> {
        self.message =
            string_argument(arguments, "message").unwrap_or_else(|| "task failed".into());
        Ok(())
    }

    async fn execute(&mut self, context: &TaskContext, _parents: &[TaskResult]) -> Result<Value> {
        let mut err = context.stderr();
        let _ = writeln!(err, "{}", self.message);
        Err(Error::execution(self.message.clone()))
    }
}

/// Propagates every argument as a property and returns how many it exported
#[derive(Default)]
struct Propagate {
    properties: Vec<(String, String)>,
}

#[async_trait]
impl Executable for Propagate {
    async fn init(&mut self, arguments: &TaskArguments) -> Result<()> {
        self.properties = arguments
            .keys()
            .filter_map(|key| string_argument(arguments, key).map(|v| (key.clone(), v)))
            .collect();
        Ok(())
    }

    async fn execute(&mut self, context: &TaskContext, _parents: &[TaskResult]) -> Result<Value> {
        for (key, value) in &self.properties {
            context.propagate(key.clone(), value.clone());
        }
        Ok(Value::from(self.properties.len()))
    }
}
