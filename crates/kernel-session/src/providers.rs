//! Collaborator seams implemented by the surrounding host application:
//! dependency validation, remote-server bookkeeping, and reconnect UI.

use async_trait::async_trait;
use kernel_wire::CancellationToken;

use crate::error::SessionError;
use crate::types::{CellRef, KernelConnectionMetadata, PythonEnvironment, ServerProviderHandle};

/// Re-verifies that the kernel runtime package is still importable in a
/// Python environment before a local restart.
#[async_trait]
pub trait KernelDependencyService: Send + Sync {
    async fn ensure_kernel_is_usable(
        &self,
        interpreter: &PythonEnvironment,
        token: &CancellationToken,
    ) -> Result<(), SessionError>;
}

/// Registry of remote-server providers.
#[async_trait]
pub trait ServerProviderRegistry: Send + Sync {
    /// Server ids currently listed by the provider that registered
    /// `handle`. `Ok(None)` means the provider itself is not known.
    async fn list_server_handles(
        &self,
        handle: &ServerProviderHandle,
    ) -> Result<Option<Vec<String>>, SessionError>;
}

/// Storage of saved server URIs; entries are evicted once a server is
/// confirmed gone.
#[async_trait]
pub trait ServerUriStorage: Send + Sync {
    async fn remove(&self, handle: &ServerProviderHandle) -> Result<(), SessionError>;
}

/// An opaque UI resource released by dropping or disposing.
pub trait Disposable: Send + Sync {
    fn dispose(&self);
}

/// Reconnect-facing UI surface. The monitor only creates and disposes
/// handles, never inspects them.
pub trait ReconnectUi: Send + Sync {
    fn begin_reconnect_progress(&self, kernel_name: &str) -> Box<dyn Disposable>;
    fn show_kernel_crash_error(&self, kernel_name: &str, last_cell: Option<&CellRef>);
}

/// The monitor's view of a logical kernel.
#[async_trait]
pub trait MonitoredKernel: Send + Sync {
    fn id(&self) -> String;
    fn display_name(&self) -> String;
    fn metadata(&self) -> KernelConnectionMetadata;
    fn is_disposed(&self) -> bool;
    async fn dispose(&self);
}
