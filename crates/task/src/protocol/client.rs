//! Launcher-side handle on a registered worker runtime

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use tasklaunch_core::{Error, ExecutionNode, Result, TaskResult};

use super::registration::RegisteredRuntime;
use super::types::{
    methods, CreateLauncherParams, CreateLauncherResult, CreateNodeParams, CreateNodeResult,
    DoTaskParams, Empty, JsonRpcRequest, JsonRpcResponse, RegisteredParams, TerminateParams,
    JSONRPC_VERSION,
};
use crate::executable::TaskArguments;
use crate::launcher::TaskLauncherInitializer;

type Pending = DashMap<u64, oneshot::Sender<JsonRpcResponse<Value>>>;

struct RuntimeInner {
    info: RegisteredParams,
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Connection to a worker runtime, multiplexing requests by id
#[derive(Clone)]
pub struct ChildRuntime {
    inner: Arc<RuntimeInner>,
}

impl ChildRuntime {
    /// Take over a freshly registered worker connection
    #[must_use]
    pub fn new(registered: RegisteredRuntime) -> Self {
        let RegisteredRuntime {
            info,
            mut reader,
            writer,
        } = registered;
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let deployment_id = info.deployment_id;
        let reader = tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(deployment_id, error = %e, "worker connection failed");
                        break;
                    }
                }
                let response: JsonRpcResponse<Value> = match serde_json::from_str(line.trim()) {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(
                            deployment_id,
                            error = %e,
                            "ignoring malformed worker response"
                        );
                        continue;
                    }
                };
                if response.jsonrpc != JSONRPC_VERSION {
                    tracing::warn!(
                        deployment_id,
                        version = %response.jsonrpc,
                        "ignoring response with wrong protocol version"
                    );
                    continue;
                }
                match reader_pending.remove(&response.id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(response);
                    }
                    None => tracing::debug!(
                        deployment_id,
                        id = response.id,
                        "response for a detached call"
                    ),
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every call still in flight.
            reader_pending.clear();
        });

        Self {
            inner: Arc::new(RuntimeInner {
                info,
                writer: Mutex::new(writer),
                pending,
                next_id: AtomicU64::new(1),
                closed,
                reader,
            }),
        }
    }

    #[must_use]
    pub fn info(&self) -> &RegisteredParams {
        &self.inner.info
    }

    /// Whether the worker closed its end of the connection
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send a request and return a handle on its response
    pub async fn start_call<P, R>(&self, method: &str, params: P) -> Result<PendingCall<R>>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(Error::protocol("worker connection closed"));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(method, params, id);
        let request_json = serde_json::to_string(&request)
            .map_err(|e| Error::protocol(format!("Failed to serialize request: {e}")))?;

        let (sender, receiver) = oneshot::channel();
        self.inner.pending.insert(id, sender);
        let call = PendingCall {
            id,
            method: method.to_string(),
            receiver,
            pending: Arc::downgrade(&self.inner.pending),
            _result: PhantomData,
        };
        if self.is_closed() {
            return Err(Error::protocol("worker connection closed"));
        }

        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(format!("{request_json}\n").as_bytes())
            .await
            .map_err(|e| Error::protocol(format!("Failed to send request: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::protocol(format!("Failed to send request: {e}")))?;
        Ok(call)
    }

    /// Send a request and wait for its response
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.start_call(method, params).await?.await
    }

    /// Create an execution node inside the worker
    pub async fn create_node(&self, node_name: &str) -> Result<ExecutionNode> {
        let result: CreateNodeResult = self
            .call(
                methods::CREATE_NODE,
                CreateNodeParams {
                    node_name: node_name.to_string(),
                },
            )
            .await?;
        Ok(result.node)
    }

    /// Instantiate a task launcher on `node_name`
    pub async fn create_launcher(
        &self,
        node_name: &str,
        initializer: TaskLauncherInitializer,
    ) -> Result<RemoteTaskLauncher> {
        let result: CreateLauncherResult = self
            .call(
                methods::CREATE_LAUNCHER,
                CreateLauncherParams {
                    node_name: node_name.to_string(),
                    initializer,
                },
            )
            .await?;
        Ok(RemoteTaskLauncher {
            runtime: self.clone(),
            launcher_id: result.launcher_id,
        })
    }

    /// Abort every launcher and drop every node of the worker
    pub async fn kill_all_nodes(&self) -> Result<()> {
        let _: Empty = self.call(methods::KILL_ALL_NODES, Empty {}).await?;
        Ok(())
    }

    /// Ask the worker process to exit. A connection closed in response counts as success.
    pub async fn kill(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.call::<_, Empty>(methods::KILL_RUNTIME, Empty {}).await {
            Ok(_) => Ok(()),
            Err(_) if self.is_closed() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A request in flight. Dropping it detaches from the response.
pub struct PendingCall<R> {
    id: u64,
    method: String,
    receiver: oneshot::Receiver<JsonRpcResponse<Value>>,
    pending: Weak<Pending>,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> Future for PendingCall<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let response = match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(Error::protocol(format!(
                    "worker connection closed during '{}'",
                    self.method
                ))))
            }
            Poll::Ready(Ok(response)) => response,
        };
        if let Some(error) = response.error {
            let message = match error.data {
                Some(data) => format!(
                    "'{}' failed: {} (code {}) - Additional data: {}",
                    self.method, error.message, error.code, data
                ),
                None => format!(
                    "'{}' failed: {} (code {})",
                    self.method, error.message, error.code
                ),
            };
            return Poll::Ready(Err(Error::protocol(message)));
        }
        let result = response.result.unwrap_or(Value::Null);
        Poll::Ready(serde_json::from_value(result).map_err(|e| {
            Error::protocol(format!("Failed to parse '{}' response: {e}", self.method))
        }))
    }
}

impl<R> Drop for PendingCall<R> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.upgrade() {
            pending.remove(&self.id);
        }
    }
}

/// Task launcher living inside a worker
#[derive(Clone)]
pub struct RemoteTaskLauncher {
    runtime: ChildRuntime,
    launcher_id: u64,
}

impl RemoteTaskLauncher {
    #[must_use]
    pub fn launcher_id(&self) -> u64 {
        self.launcher_id
    }

    /// Start the task. The returned handle resolves to the remote result.
    pub async fn do_task(
        &self,
        executable: &str,
        arguments: TaskArguments,
        parents: &[TaskResult],
    ) -> Result<PendingCall<TaskResult>> {
        self.runtime
            .start_call(
                methods::DO_TASK,
                DoTaskParams {
                    launcher_id: self.launcher_id,
                    executable: executable.to_string(),
                    arguments,
                    parents: parents.to_vec(),
                },
            )
            .await
    }

    pub async fn terminate(&self, normal: bool) -> Result<()> {
        let _: Empty = self
            .runtime
            .call(
                methods::TERMINATE,
                TerminateParams {
                    launcher_id: self.launcher_id,
                    normal,
                },
            )
            .await?;
        Ok(())
    }
}
