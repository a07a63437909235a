//! Session and kernel-connection domain types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Transport class of a session, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    LocalRaw,
    LocalJupyter,
    RemoteJupyter,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::LocalRaw => write!(f, "localRaw"),
            SessionKind::LocalJupyter => write!(f, "localJupyter"),
            SessionKind::RemoteJupyter => write!(f, "remoteJupyter"),
        }
    }
}

/// How a Python environment is identified. Discriminated explicitly, not
/// probed structurally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PythonEnvironment {
    Executable(PathBuf),
    EnvironmentId(String),
}

/// Handle identifying the provider-registered server a session rides on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProviderHandle {
    pub extension_id: String,
    pub id: String,
    pub handle: String,
}

/// How a kernel connection was established.
///
/// A session on a local Jupyter server is still `is_local` but may carry
/// a server handle; only raw python-env kernels have no server at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelConnectionMetadata {
    LocalKernelSpec {
        kernel_spec: String,
        interpreter: Option<PythonEnvironment>,
        server_handle: Option<ServerProviderHandle>,
    },
    LocalPythonEnv {
        kernel_spec: String,
        interpreter: PythonEnvironment,
    },
    RemoteKernelSpec {
        kernel_spec: String,
        server_handle: ServerProviderHandle,
    },
    ConnectToLiveRemoteKernel {
        kernel_id: String,
        server_handle: ServerProviderHandle,
    },
}

impl KernelConnectionMetadata {
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            KernelConnectionMetadata::LocalKernelSpec { .. }
                | KernelConnectionMetadata::LocalPythonEnv { .. }
        )
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    pub fn server_handle(&self) -> Option<&ServerProviderHandle> {
        match self {
            KernelConnectionMetadata::LocalKernelSpec { server_handle, .. } => {
                server_handle.as_ref()
            }
            KernelConnectionMetadata::LocalPythonEnv { .. } => None,
            KernelConnectionMetadata::RemoteKernelSpec { server_handle, .. } => Some(server_handle),
            KernelConnectionMetadata::ConnectToLiveRemoteKernel { server_handle, .. } => {
                Some(server_handle)
            }
        }
    }

    pub fn interpreter(&self) -> Option<&PythonEnvironment> {
        match self {
            KernelConnectionMetadata::LocalKernelSpec { interpreter, .. } => interpreter.as_ref(),
            KernelConnectionMetadata::LocalPythonEnv { interpreter, .. } => Some(interpreter),
            _ => None,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            KernelConnectionMetadata::LocalKernelSpec { kernel_spec, .. }
            | KernelConnectionMetadata::LocalPythonEnv { kernel_spec, .. }
            | KernelConnectionMetadata::RemoteKernelSpec { kernel_spec, .. } => kernel_spec.clone(),
            KernelConnectionMetadata::ConnectToLiveRemoteKernel { kernel_id, .. } => {
                format!("live kernel {kernel_id}")
            }
        }
    }
}

/// What kind of document a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Notebook,
    InteractiveWindow,
}

/// The document a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    pub resource_type: ResourceType,
}

/// Pointer to a cell, used to annotate crash errors with the cell that
/// was executing when the kernel went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRef {
    pub uri: String,
    pub cell_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_handle() -> ServerProviderHandle {
        ServerProviderHandle {
            extension_id: "ms-jupyter".into(),
            id: "server-1".into(),
            handle: "handle-1".into(),
        }
    }

    #[test]
    fn test_metadata_locality() {
        let local = KernelConnectionMetadata::LocalPythonEnv {
            kernel_spec: "python3".into(),
            interpreter: PythonEnvironment::Executable("/usr/bin/python3".into()),
        };
        assert!(local.is_local());
        assert!(!local.is_remote());
        assert!(local.server_handle().is_none());

        let live = KernelConnectionMetadata::ConnectToLiveRemoteKernel {
            kernel_id: "abc".into(),
            server_handle: remote_handle(),
        };
        assert!(live.is_remote());
        assert_eq!(live.server_handle().unwrap().id, "server-1");
    }

    #[test]
    fn test_local_jupyter_server_handle() {
        let local_jupyter = KernelConnectionMetadata::LocalKernelSpec {
            kernel_spec: "python3".into(),
            interpreter: None,
            server_handle: Some(remote_handle()),
        };
        assert!(local_jupyter.is_local());
        assert!(local_jupyter.server_handle().is_some());
    }

    #[test]
    fn test_session_kind_display() {
        assert_eq!(SessionKind::LocalRaw.to_string(), "localRaw");
        assert_eq!(SessionKind::RemoteJupyter.to_string(), "remoteJupyter");
    }
}
