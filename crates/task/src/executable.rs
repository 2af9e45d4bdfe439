//! User task code and the containers the scheduler hands to launchers.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tasklaunch_core::{Error, ForkEnvironment, Result, Script, TaskResult};

use crate::context::TaskContext;

/// Arguments a task is initialised with
pub type TaskArguments = BTreeMap<String, Value>;

/// Code run by the Java and forked launchers
#[async_trait]
pub trait Executable: Send {
    /// Called once before [`execute`](Executable::execute)
    async fn init(&mut self, _arguments: &TaskArguments) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self, context: &TaskContext, parents: &[TaskResult]) -> Result<Value>;
}

pub type ExecutableFactory = Arc<dyn Fn() -> Box<dyn Executable> + Send + Sync>;

/// Materialises task code from a name, the way a class server would
#[derive(Clone, Default)]
pub struct ExecutableRegistry {
    factories: Arc<RwLock<HashMap<String, ExecutableFactory>>>,
}

impl ExecutableRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `echo`, `sleep`, `fail` and `propagate`
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::builtins::register(&registry);
        registry
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Executable> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Executable>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("unknown executable '{name}'")))?;
        Ok(factory())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

impl fmt::Debug for ExecutableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("ExecutableRegistry").field("executables", &names).finish()
    }
}

/// Where the code of an in-process task comes from
pub enum TaskCode {
    /// Looked up in the registry
    Named(String),
    /// Supplied directly
    Instance(Box<dyn Executable>),
}

impl fmt::Debug for TaskCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskCode::Named(name) => f.debug_tuple("Named").field(name).finish(),
            TaskCode::Instance(_) => f.write_str("Instance(..)"),
        }
    }
}

#[derive(Debug)]
pub struct JavaExecutableContainer {
    pub code: TaskCode,
    pub arguments: TaskArguments,
}

impl JavaExecutableContainer {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            code: TaskCode::Named(name.into()),
            arguments: TaskArguments::new(),
        }
    }

    #[must_use]
    pub fn instance(executable: Box<dyn Executable>) -> Self {
        Self {
            code: TaskCode::Instance(executable),
            arguments: TaskArguments::new(),
        }
    }

    #[must_use]
    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub(crate) fn instantiate(
        self,
        registry: &ExecutableRegistry,
    ) -> Result<(Box<dyn Executable>, TaskArguments)> {
        let executable = match self.code {
            TaskCode::Named(name) => registry.instantiate(&name)?,
            TaskCode::Instance(executable) => executable,
        };
        Ok((executable, self.arguments))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NativeExecutableContainer {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// May rewrite `command` before the process is started
    pub generation_script: Option<Script>,
    pub working_dir: Option<PathBuf>,
    /// Passed to the process verbatim
    pub env: BTreeMap<String, String>,
}

impl NativeExecutableContainer {
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_generation_script(mut self, script: Script) -> Self {
        self.generation_script = Some(script);
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ForkedJavaExecutableContainer {
    /// Registry name of the executable, resolved inside the worker
    pub executable: String,
    pub arguments: TaskArguments,
    pub fork_environment: ForkEnvironment,
}

impl ForkedJavaExecutableContainer {
    #[must_use]
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            arguments: TaskArguments::new(),
            fork_environment: ForkEnvironment::default(),
        }
    }

    #[must_use]
    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_fork_environment(mut self, environment: ForkEnvironment) -> Self {
        self.fork_environment = environment;
        self
    }
}

/// Everything a launcher needs to run one task
#[derive(Debug)]
pub enum ExecutableContainer {
    Java(JavaExecutableContainer),
    Native(NativeExecutableContainer),
    ForkedJava(ForkedJavaExecutableContainer),
}

impl ExecutableContainer {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutableContainer::Java(_) => "java",
            ExecutableContainer::Native(_) => "native",
            ExecutableContainer::ForkedJava(_) => "forked-java",
        }
    }
}

impl From<JavaExecutableContainer> for ExecutableContainer {
    fn from(container: JavaExecutableContainer) -> Self {
        ExecutableContainer::Java(container)
    }
}

impl From<NativeExecutableContainer> for ExecutableContainer {
    fn from(container: NativeExecutableContainer) -> Self {
        ExecutableContainer::Native(container)
    }
}

impl From<ForkedJavaExecutableContainer> for ExecutableContainer {
    fn from(container: ForkedJavaExecutableContainer) -> Self {
        ExecutableContainer::ForkedJava(container)
    }
}
