//! JSON-RPC protocol types spoken between a launcher and its forked worker
//!
//! Every message is one JSON document terminated by `\n`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tasklaunch_core::{ExecutionNode, TaskResult};

use crate::executable::TaskArguments;
use crate::launcher::TaskLauncherInitializer;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method names
pub mod methods {
    /// Worker → launcher, first line of every connection
    pub const REGISTERED: &str = "runtime.registered";
    pub const CREATE_NODE: &str = "runtime.createNode";
    pub const KILL_ALL_NODES: &str = "runtime.killAllNodes";
    pub const KILL_RUNTIME: &str = "runtime.kill";
    pub const CREATE_LAUNCHER: &str = "launcher.create";
    pub const DO_TASK: &str = "launcher.doTask";
    pub const TERMINATE: &str = "launcher.terminate";
}

/// Standard JSON-RPC error codes
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// JSON-RPC 2.0 request structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: String,
    pub method: String,
    pub params: T,
    pub id: u64,
}

impl<T> JsonRpcRequest<T> {
    pub fn new(method: &str, params: T, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 notification structure (no id, no response)
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcNotification<T> {
    pub jsonrpc: String,
    pub method: String,
    pub params: T,
}

impl<T> JsonRpcNotification<T> {
    pub fn new(method: &str, params: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: u64,
}

impl<T> JsonRpcResponse<T> {
    pub fn success(id: u64, result: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC error structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Sent by a worker as soon as it is connected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredParams {
    pub deployment_id: u32,
    pub pid: u32,
    pub node_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateNodeParams {
    pub node_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateNodeResult {
    pub node: ExecutionNode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateLauncherParams {
    pub node_name: String,
    pub initializer: TaskLauncherInitializer,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateLauncherResult {
    pub launcher_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DoTaskParams {
    pub launcher_id: u64,
    pub executable: String,
    #[serde(default)]
    pub arguments: TaskArguments,
    #[serde(default)]
    pub parents: Vec<TaskResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TerminateParams {
    pub launcher_id: u64,
    pub normal: bool,
}

/// Parameters and results of methods that carry nothing
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Empty {}
