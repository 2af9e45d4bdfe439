//! Runtime of a forked worker process.
//!
//! The worker connects to the contact URL it was started with, announces
//! itself with `runtime.registered`, then serves launcher requests until it
//! is told to exit or the parent hangs up. Each task runs in an in-process
//! launcher whose output goes straight to the worker's own stdout and stderr.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use tasklaunch_core::{Error, ExecutionNode, Result};

use crate::executable::JavaExecutableContainer;
use crate::launcher::{LauncherHandle, LauncherServices, TaskLauncher, TaskLauncherInitializer};
use crate::logging::StdAppender;
use crate::protocol::parse_contact_url;
use crate::protocol::types::{
    codes, methods, CreateLauncherParams, CreateLauncherResult, CreateNodeParams,
    CreateNodeResult, DoTaskParams, Empty, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RegisteredParams, TerminateParams, JSONRPC_VERSION,
};
use crate::script::local_node;

/// How the worker was started
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// `unix://` URL of the parent's registration hub
    pub contact_url: String,
    pub node_count: u32,
    /// Session id the parent is waiting on
    pub deployment_id: u32,
}

type Writer = Arc<Mutex<OwnedWriteHalf>>;

enum LauncherSlot {
    Created(TaskLauncherInitializer),
    Running(LauncherHandle),
}

#[derive(Default)]
struct WorkerState {
    nodes: HashMap<String, ExecutionNode>,
    launchers: HashMap<u64, LauncherSlot>,
}

/// What the serve loop does after a request
enum Flow {
    Continue,
    Exit,
}

/// Connect to the parent, register, and serve requests until told to stop
pub async fn run_worker(options: WorkerOptions, services: LauncherServices) -> Result<()> {
    let path = parse_contact_url(&options.contact_url)?;
    let stream = UnixStream::connect(&path).await.map_err(|e| {
        Error::protocol(format!("Failed to connect to {}: {e}", options.contact_url))
    })?;
    let (read_half, write_half) = stream.into_split();
    let writer: Writer = Arc::new(Mutex::new(write_half));

    let registered = JsonRpcNotification::new(
        methods::REGISTERED,
        RegisteredParams {
            deployment_id: options.deployment_id,
            pid: std::process::id(),
            node_count: options.node_count,
        },
    );
    send_line(&writer, &registered).await?;
    tracing::debug!(deployment_id = options.deployment_id, "registered with parent");

    let mut server = WorkerServer {
        services,
        writer,
        state: WorkerState::default(),
        next_launcher: 1,
        tasks: JoinSet::new(),
    };

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::protocol(format!("Failed to read request: {e}")))?;
        if read == 0 {
            tracing::debug!("parent closed the connection");
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        match server.handle_line(line.trim()).await? {
            Flow::Continue => {}
            Flow::Exit => break,
        }
    }

    server.shutdown().await;
    Ok(())
}

struct WorkerServer {
    services: LauncherServices,
    writer: Writer,
    state: WorkerState,
    next_launcher: u64,
    tasks: JoinSet<()>,
}

impl WorkerServer {
    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        let request: JsonRpcRequest<Value> = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed request");
                return Ok(Flow::Continue);
            }
        };
        let id = request.id;
        if request.jsonrpc != JSONRPC_VERSION {
            self.reply_error(id, codes::INVALID_REQUEST, "Invalid JSON-RPC version")
                .await?;
            return Ok(Flow::Continue);
        }
        tracing::debug!(method = %request.method, id, "handling request");

        match request.method.as_str() {
            methods::CREATE_NODE => {
                let Some(params) = self.params::<CreateNodeParams>(id, request.params).await? else {
                    return Ok(Flow::Continue);
                };
                let node = local_node(params.node_name.clone());
                self.state.nodes.insert(params.node_name, node.clone());
                self.reply(id, CreateNodeResult { node }).await?;
            }
            methods::CREATE_LAUNCHER => {
                let Some(params) = self.params::<CreateLauncherParams>(id, request.params).await?
                else {
                    return Ok(Flow::Continue);
                };
                let Some(node) = self.state.nodes.get(&params.node_name).cloned() else {
                    let message = format!("unknown node '{}'", params.node_name);
                    self.reply_error(id, codes::INVALID_PARAMS, message).await?;
                    return Ok(Flow::Continue);
                };
                let launcher_id = self.next_launcher;
                self.next_launcher += 1;
                let initializer = params.initializer.with_node(node);
                self.state
                    .launchers
                    .insert(launcher_id, LauncherSlot::Created(initializer));
                self.reply(id, CreateLauncherResult { launcher_id }).await?;
            }
            methods::DO_TASK => {
                let Some(params) = self.params::<DoTaskParams>(id, request.params).await? else {
                    return Ok(Flow::Continue);
                };
                self.start_task(id, params).await?;
            }
            methods::TERMINATE => {
                let Some(params) = self.params::<TerminateParams>(id, request.params).await? else {
                    return Ok(Flow::Continue);
                };
                let discard = match self.state.launchers.get(&params.launcher_id) {
                    Some(LauncherSlot::Running(handle)) => {
                        handle.terminate(params.normal);
                        false
                    }
                    Some(LauncherSlot::Created(_)) => !params.normal,
                    None => {
                        tracing::debug!(
                            launcher_id = params.launcher_id,
                            "terminate for an unknown launcher"
                        );
                        false
                    }
                };
                if discard {
                    self.state.launchers.remove(&params.launcher_id);
                }
                self.reply(id, Empty {}).await?;
            }
            methods::KILL_ALL_NODES => {
                for slot in self.state.launchers.values() {
                    if let LauncherSlot::Running(handle) = slot {
                        handle.terminate(false);
                    }
                }
                self.state.launchers.clear();
                self.state.nodes.clear();
                self.reply(id, Empty {}).await?;
            }
            methods::KILL_RUNTIME => {
                self.reply(id, Empty {}).await?;
                return Ok(Flow::Exit);
            }
            other => {
                self.reply_error(id, codes::METHOD_NOT_FOUND, format!("Method not found: {other}"))
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn start_task(&mut self, id: u64, params: DoTaskParams) -> Result<()> {
        let initializer = match self.state.launchers.remove(&params.launcher_id) {
            Some(LauncherSlot::Created(initializer)) => initializer,
            Some(running @ LauncherSlot::Running(_)) => {
                self.state.launchers.insert(params.launcher_id, running);
                return self
                    .reply_error(id, codes::INVALID_REQUEST, "launcher is already running a task")
                    .await;
            }
            None => {
                let message = format!("unknown launcher {}", params.launcher_id);
                return self.reply_error(id, codes::INVALID_PARAMS, message).await;
            }
        };

        let mut launcher = TaskLauncher::java(initializer, self.services.clone());
        launcher.activate_logs(Arc::new(StdAppender));
        self.state
            .launchers
            .insert(params.launcher_id, LauncherSlot::Running(launcher.handle()));

        let DoTaskParams {
            executable,
            arguments,
            parents,
            ..
        } = params;
        let mut container = JavaExecutableContainer::named(executable);
        container.arguments = arguments;
        let writer = Arc::clone(&self.writer);
        self.tasks.spawn(async move {
            let result = launcher.do_task(None, container.into(), &parents).await;
            launcher.terminate().await;
            if let Err(e) = send_line(&writer, &JsonRpcResponse::success(id, result)).await {
                tracing::warn!(error = %e, "could not return task result");
            }
        });
        Ok(())
    }

    /// Decode request parameters, answering `INVALID_PARAMS` when they do not fit
    async fn params<P: DeserializeOwned>(&self, id: u64, params: Value) -> Result<Option<P>> {
        match serde_json::from_value(params) {
            Ok(params) => Ok(Some(params)),
            Err(e) => {
                self.reply_error(id, codes::INVALID_PARAMS, format!("Invalid params: {e}"))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn reply<R: Serialize>(&self, id: u64, result: R) -> Result<()> {
        send_line(&self.writer, &JsonRpcResponse::success(id, result)).await
    }

    async fn reply_error(&self, id: u64, code: i32, message: impl Into<String>) -> Result<()> {
        send_line(&self.writer, &JsonRpcResponse::<Value>::failure(id, code, message)).await
    }

    async fn shutdown(mut self) {
        for slot in self.state.launchers.values() {
            if let LauncherSlot::Running(handle) = slot {
                handle.terminate(false);
            }
        }
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

async fn send_line<T: Serialize>(writer: &Writer, message: &T) -> Result<()> {
    let json = serde_json::to_string(message)
        .map_err(|e| Error::protocol(format!("Failed to serialize message: {e}")))?;
    let mut writer = writer.lock().await;
    writer
        .write_all(format!("{json}\n").as_bytes())
        .await
        .map_err(|e| Error::protocol(format!("Failed to send message: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::protocol(format!("Failed to send message: {e}")))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::{ChildRuntime, RegistrationHub, WaitOutcome};
    use std::time::Duration;
    use tasklaunch_config::WorkerSettings;
    use tasklaunch_core::{JobId, TaskId};
    use tempfile::TempDir;

    async fn connected_worker(dir: &TempDir) -> (Arc<RegistrationHub>, ChildRuntime) {
        let settings = WorkerSettings {
            socket_dir: Some(dir.path().to_path_buf()),
            ..WorkerSettings::default()
        };
        let hub = RegistrationHub::bind(&settings).await.unwrap();
        let session = hub.fresh_session_id();
        let mut registration = hub.subscribe(session).unwrap();
        let options = WorkerOptions {
            contact_url: hub.contact_url(),
            node_count: 1,
            deployment_id: session,
        };
        tokio::spawn(run_worker(options, LauncherServices::default()));

        let WaitOutcome::Registered(registered) = registration.wait(Duration::from_secs(5)).await
        else {
            panic!("worker did not register");
        };
        (hub, ChildRuntime::new(registered))
    }

    #[tokio::test]
    async fn serves_a_task_end_to_end() {
        let dir = TempDir::new().unwrap();
        let (_hub, runtime) = connected_worker(&dir).await;
        assert_eq!(runtime.info().pid, std::process::id());

        let node = runtime.create_node("forked-task-node-1").await.unwrap();
        assert_eq!(node.name, "forked-task-node-1");

        let task_id = TaskId::new(JobId::new(1, "job"), 1, "task");
        let launcher = runtime
            .create_launcher(&node.name, TaskLauncherInitializer::new(task_id))
            .await
            .unwrap();
        let mut arguments = crate::executable::TaskArguments::new();
        arguments.insert("message".into(), "hi".into());
        let result = launcher
            .do_task(crate::builtins::ECHO, arguments, &[])
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result.value().unwrap(), &Value::from("hi"));

        runtime.kill().await.unwrap();
    }

    #[tokio::test]
    async fn launcher_needs_an_existing_node() {
        let dir = TempDir::new().unwrap();
        let (_hub, runtime) = connected_worker(&dir).await;
        let task_id = TaskId::new(JobId::new(1, "job"), 2, "task");
        let err = runtime
            .create_launcher("missing", TaskLauncherInitializer::new(task_id))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown node"));
    }

    #[tokio::test]
    async fn unknown_methods_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (_hub, runtime) = connected_worker(&dir).await;
        let err = runtime
            .call::<_, Empty>("runtime.reboot", Empty {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Method not found"));
    }
}
