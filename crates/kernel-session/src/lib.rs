//! Kernel session connections and their lifecycle policy.
//!
//! Sits on top of `kernel-wire`: a [`SessionConnectionCore`] bridges a
//! transport session's signals up to subscribers, the two wrappers
//! ([`JupyterSessionWrapper`], [`RawSessionWrapper`]) add
//! shutdown/restart policy per transport kind, [`CodeExecutionRequest`]
//! runs one code submission end to end, and [`AutoReconnectMonitor`]
//! supervises reconnects across every live kernel.

pub mod connection;
pub mod error;
pub mod execution;
pub mod jupyter_session;
pub mod providers;
pub mod raw_session;
pub mod reconnect;
pub mod transport;
pub mod types;

pub use connection::{KernelSessionConnection, SessionConnectionCore};
pub use error::{KernelFailure, SessionError};
pub use execution::{CodeExecutionRequest, CompletionKind, ExecutionIdFactory, ExecutionStatus};
pub use jupyter_session::JupyterSessionWrapper;
pub use providers::{
    Disposable, KernelDependencyService, MonitoredKernel, ReconnectUi, ServerProviderRegistry,
    ServerUriStorage,
};
pub use raw_session::RawSessionWrapper;
pub use reconnect::AutoReconnectMonitor;
pub use transport::{SessionTransport, TransportSignals};
pub use types::{
    CellRef, KernelConnectionMetadata, PythonEnvironment, Resource, ResourceType,
    ServerProviderHandle, SessionKind,
};
