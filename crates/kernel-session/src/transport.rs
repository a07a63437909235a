//! The seam between session connections and the transport layer that
//! actually owns kernel processes and server sessions.
//!
//! The factory code that starts kernels lives outside this crate; it
//! hands sessions in through [`SessionTransport`]. Tests drive the same
//! seam with in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use jupyter_protocol::JupyterMessage;
use kernel_wire::{AnyMessage, ConnectionStatus, KernelConnectionProxy, KernelStatus, Signal};

use crate::error::SessionError;

/// The eight signals a transport session exposes. Bridged 1:1 by the
/// session connection, in source order, with no coalescing.
pub struct TransportSignals {
    /// A session property (path, name, type) changed; carries its name.
    pub property_changed: Signal<String>,
    /// The underlying kernel was swapped; carries the new kernel id.
    pub kernel_changed: Signal<String>,
    pub status_changed: Signal<KernelStatus>,
    pub connection_status_changed: Signal<ConnectionStatus>,
    pub iopub_message: Signal<Arc<JupyterMessage>>,
    pub unhandled_message: Signal<Arc<JupyterMessage>>,
    pub any_message: Signal<AnyMessage>,
    /// The kernel is waiting on stdin input.
    pub pending_input: Signal<Arc<JupyterMessage>>,
}

impl TransportSignals {
    pub fn new() -> Self {
        Self {
            property_changed: Signal::new(),
            kernel_changed: Signal::new(),
            status_changed: Signal::new(),
            connection_status_changed: Signal::new(),
            iopub_message: Signal::new(),
            unhandled_message: Signal::new(),
            any_message: Signal::new(),
            pending_input: Signal::new(),
        }
    }
}

impl Default for TransportSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// A live transport session: identity, the wrapped kernel connection,
/// signals, property setters, and teardown.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    fn id(&self) -> String;
    fn path(&self) -> String;
    fn name(&self) -> String;
    fn session_type(&self) -> String;

    /// The current kernel connection, if one is attached. May be swapped
    /// by the transport across restarts.
    fn kernel(&self) -> Option<Arc<KernelConnectionProxy>>;

    fn is_disposed(&self) -> bool;
    fn signals(&self) -> &TransportSignals;

    async fn set_path(&self, path: &str) -> Result<(), SessionError>;
    async fn set_name(&self, name: &str) -> Result<(), SessionError>;
    async fn set_session_type(&self, session_type: &str) -> Result<(), SessionError>;

    /// Ask the server to shut the session down.
    async fn shutdown(&self) -> Result<(), SessionError>;

    /// Tear down the local session object. Must be safe to call twice.
    fn dispose(&self);
}
