// Shared types used across the Cirrus control plane and the in-VM agent.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

/// Port the in-VM agent listens on for dispatches.
pub const AGENT_PORT: u16 = 8081;

/// Entry point used when a function does not declare one.
pub const DEFAULT_ENTRY_POINT: &str = "handler.handler";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function already exists: {0}")]
    FunctionAlreadyExists(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("VM not tracked: {0}")]
    UnknownVm(String),

    #[error("Warm pool empty and VM creation failed: {0}")]
    CapacityExhausted(String),

    #[error("VM creation failed: {0}")]
    VmCreateFailed(String),

    #[error("Dispatch to agent failed: {0}")]
    DispatchFailed(String),

    #[error("Execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("Execution queue is full")]
    QueueFull,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a storage-layer failure, keeping only its message.
    pub fn storage(err: impl Display) -> Self {
        Error::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle states of an execution record.
///
/// `Completed`, `Failed` and `Timeout` are terminal: once persisted they are
/// never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

impl FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(Error::Internal(format!("unknown execution status: {other}"))),
        }
    }
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of a micro-VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Initializing,
    Ready,
    Busy,
    Terminated,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Initializing => "initializing",
            VmStatus::Ready => "ready",
            VmStatus::Busy => "busy",
            VmStatus::Terminated => "terminated",
        }
    }
}

impl FromStr for VmStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initializing" => Ok(VmStatus::Initializing),
            "ready" => Ok(VmStatus::Ready),
            "busy" => Ok(VmStatus::Busy),
            "terminated" => Ok(VmStatus::Terminated),
            other => Err(Error::Internal(format!("unknown vm status: {other}"))),
        }
    }
}

impl Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload the scheduler POSTs to the agent's `/execute` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub function_id: String,
    pub name: String,
    pub code: String,
    pub requirements: String,
    pub config: String,
    pub runtime: String,
    pub entry_point: String,
    pub environment: HashMap<String, String>,
    pub request_id: String,
    pub timeout: u64,
    pub memory: u32,
    pub version: String,
    pub event: serde_json::Value,
    pub context: serde_json::Value,
}

/// Completion report the agent POSTs back to `/api/results`.
///
/// `status_code` is 200 on success; any other value marks the execution
/// failed. Delivery is at-least-once, so consumers must treat duplicates as
/// no-ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultReport {
    pub request_id: String,
    pub function_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_kb: Option<i64>,
}

/// Status report the agent sends to `/api/vms/register` on boot and after
/// each execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmHeartbeat {
    pub vm_id: String,
    pub ip_address: String,
    pub machine_name: String,
    pub status: VmStatus,
}

/// Outcome of a scheduling call, returned to API callers.
///
/// `status_code` follows the HTTP-flavoured convention of the wire protocol:
/// 200 terminal success, 202 accepted (async), 102 still processing, 500
/// failed, 504 timed out waiting for the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub request_id: String,
    pub function_id: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl InvocationOutcome {
    /// 202-style acknowledgement for an accepted asynchronous invocation.
    pub fn accepted(request_id: String, function_id: String) -> Self {
        Self {
            request_id,
            function_id,
            status_code: 202,
            output: None,
            error_message: None,
            duration_ms: None,
        }
    }

    /// 102-style marker for an execution that is still in flight.
    pub fn processing(request_id: String, function_id: String) -> Self {
        Self {
            request_id,
            function_id,
            status_code: 102,
            output: None,
            error_message: None,
            duration_ms: None,
        }
    }
}

impl Display for InvocationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "InvocationOutcome(request_id: {}, status: {}, error: {:?})",
            self.request_id, self.status_code, self.error_message
        )
    }
}

/// Fields describing a stored function, as exposed by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub id: String,
    pub name: String,
    pub runtime: String,
    pub memory: u32,
    pub timeout: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: String,
    pub version: String,
}

/// Code payload fetched once per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCode {
    pub code: String,
    pub requirements: String,
    pub config: String,
}

/// Increment the patch component of a `major.minor.patch` version string.
///
/// Unparseable input resets to "1.0.1" rather than failing: a function with a
/// mangled version is still updatable.
pub fn bump_patch_version(version: &str) -> String {
    let mut parts = version.splitn(3, '.');
    let major: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
    let minor: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    format!("{}.{}.{}", major, minor, patch + 1)
}
