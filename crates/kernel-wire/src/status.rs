//! Kernel execution and connection status types.

use jupyter_protocol::ExecutionState;
use serde::Serialize;

/// Execution status of a kernel as reported on the iopub channel.
///
/// `Unknown` is used before a kernel has reported anything; `Dead` is
/// latched once a session is disposed and takes precedence over any value
/// the transport may still report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Unknown,
    Starting,
    Idle,
    Busy,
    Terminating,
    Restarting,
    #[serde(rename = "autorestarting")]
    AutoRestarting,
    Dead,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Unknown => write!(f, "unknown"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Terminating => write!(f, "terminating"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::AutoRestarting => write!(f, "autorestarting"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

impl From<ExecutionState> for KernelStatus {
    fn from(state: ExecutionState) -> Self {
        match state {
            ExecutionState::Busy => KernelStatus::Busy,
            ExecutionState::Idle => KernelStatus::Idle,
            ExecutionState::Starting => KernelStatus::Starting,
            ExecutionState::Restarting => KernelStatus::Restarting,
            ExecutionState::Terminating => KernelStatus::Terminating,
            ExecutionState::Dead => KernelStatus::Dead,
            _ => KernelStatus::Unknown,
        }
    }
}

/// Health of the wire connection to a kernel, independent of what the
/// kernel itself is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}
