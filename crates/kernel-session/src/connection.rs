//! The session connection base: a stable facade over a replaceable
//! transport session and its kernel connection.
//!
//! [`SessionConnectionCore`] re-emits every transport signal exactly once
//! per underlying emission, tracks socket identity across reconnects, and
//! guarantees dispose-safety: after `dispose()` the session reports
//! `Dead` and emits nothing further. The concrete wrappers
//! ([`crate::jupyter_session::JupyterSessionWrapper`],
//! [`crate::raw_session::RawSessionWrapper`]) layer shutdown policy and
//! idle-wait handling on top through [`KernelSessionConnection`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use kernel_wire::{CancellationToken, ConnectionStatus, KernelStatus, Signal, SignalBridge};
use log::{debug, info};
use tokio::task::JoinHandle;

use crate::error::SessionError;
use crate::transport::{SessionTransport, TransportSignals};
use crate::types::SessionKind;

/// Identity of the kernel attachment a session last observed. When the
/// fingerprint has not changed, re-running socket initialization is a
/// no-op so downstream observers see no redundant notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SocketFingerprint {
    proxy_addr: usize,
    kernel_id: String,
    model_json: String,
    socket_id: Option<u64>,
}

pub struct SessionConnectionCore {
    transport: Arc<dyn SessionTransport>,
    kind: SessionKind,
    signals: TransportSignals,
    socket_changed: Signal<()>,
    disposed_signal: Signal<()>,
    disposed: AtomicBool,
    bridge: StdMutex<SignalBridge>,
    fingerprint: StdMutex<Option<SocketFingerprint>>,
    status_watcher: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionConnectionCore {
    /// Wrap a transport session, bridging all eight of its signals onto
    /// this session's own signal set.
    pub fn new(transport: Arc<dyn SessionTransport>, kind: SessionKind) -> Self {
        let signals = TransportSignals::new();
        let mut bridge = SignalBridge::new();
        let source = transport.signals();

        bridge.forward(
            source.property_changed.subscribe(),
            signals.property_changed.clone(),
        );
        bridge.forward(
            source.kernel_changed.subscribe(),
            signals.kernel_changed.clone(),
        );
        bridge.forward(
            source.status_changed.subscribe(),
            signals.status_changed.clone(),
        );
        bridge.forward(
            source.connection_status_changed.subscribe(),
            signals.connection_status_changed.clone(),
        );
        bridge.forward(
            source.iopub_message.subscribe(),
            signals.iopub_message.clone(),
        );
        let session_id = transport.id();
        bridge.forward_with(
            source.unhandled_message.subscribe(),
            signals.unhandled_message.clone(),
            move |message| {
                debug!(
                    "[session] {session_id} unhandled message type={}",
                    message.header.msg_type
                );
            },
        );
        bridge.forward(source.any_message.subscribe(), signals.any_message.clone());
        bridge.forward(
            source.pending_input.subscribe(),
            signals.pending_input.clone(),
        );

        Self {
            transport,
            kind,
            signals,
            socket_changed: Signal::new(),
            disposed_signal: Signal::new(),
            disposed: AtomicBool::new(false),
            bridge: StdMutex::new(bridge),
            fingerprint: StdMutex::new(None),
            status_watcher: StdMutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<dyn SessionTransport> {
        &self.transport
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn id(&self) -> String {
        self.transport.id()
    }

    pub fn path(&self) -> String {
        self.transport.path()
    }

    pub fn name(&self) -> String {
        self.transport.name()
    }

    pub fn session_type(&self) -> String {
        self.transport.session_type()
    }

    pub fn kernel_id(&self) -> Option<String> {
        self.transport.kernel().map(|k| k.kernel_info().id)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// The session's re-emitted copies of the transport signals.
    pub fn signals(&self) -> &TransportSignals {
        &self.signals
    }

    pub fn on_socket_changed(&self) -> &Signal<()> {
        &self.socket_changed
    }

    pub fn on_disposed(&self) -> &Signal<()> {
        &self.disposed_signal
    }

    /// Session status. Disposed wins over anything the transport still
    /// reports; a session with no kernel yet is `Unknown`.
    pub fn status(&self) -> KernelStatus {
        if self.is_disposed() {
            return KernelStatus::Dead;
        }
        match self.transport.kernel() {
            Some(kernel) => kernel.status(),
            None => KernelStatus::Unknown,
        }
    }

    pub async fn set_path(&self, path: &str) -> Result<(), SessionError> {
        self.transport.set_path(path).await
    }

    pub async fn set_name(&self, name: &str) -> Result<(), SessionError> {
        self.transport.set_name(name).await
    }

    pub async fn set_session_type(&self, session_type: &str) -> Result<(), SessionError> {
        self.transport.set_session_type(session_type).await
    }

    /// Restart the kernel, then re-establish socket bookkeeping so
    /// observers see the new connection's identity.
    ///
    /// Concurrent restarts are not deduplicated here; callers keep a
    /// per-kernel pending-operation map if they need coalescing.
    pub async fn restart(&self) -> Result<(), SessionError> {
        let kernel = self.transport.kernel().ok_or(SessionError::InvalidKernel)?;
        kernel
            .restart()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        self.initialize_kernel_socket()?;
        Ok(())
    }

    /// Recompute the socket-identity fingerprint of the current kernel
    /// attachment. Unchanged fingerprint is a no-op; on change the old
    /// connection-status watcher is detached, a new one attached, and
    /// `socket_changed` fires once.
    pub fn initialize_kernel_socket(&self) -> Result<(), SessionError> {
        let kernel = self.transport.kernel().ok_or(SessionError::InvalidKernel)?;
        let info = kernel.kernel_info();
        let fingerprint = SocketFingerprint {
            proxy_addr: Arc::as_ptr(&kernel) as *const () as usize,
            kernel_id: info.id.clone(),
            model_json: serde_json::to_string(&info.model)
                .map_err(|e| SessionError::Transport(e.to_string()))?,
            socket_id: kernel.socket().map(|s| s.id()),
        };

        {
            let mut current = self.fingerprint.lock().unwrap();
            if current.as_ref() == Some(&fingerprint) {
                return Ok(());
            }
            *current = Some(fingerprint);
        }

        // Swap the connection-status watcher over to the new attachment.
        let mut statuses = kernel.on_connection_status_changed().subscribe();
        let status_signal = self.signals.status_changed.clone();
        let session_id = self.transport.id();
        let watcher = tokio::spawn(async move {
            loop {
                match statuses.recv().await {
                    Ok(ConnectionStatus::Disconnected) => {
                        // Re-broadcast the current status so observers
                        // re-evaluate against the dropped connection.
                        info!("[session] {session_id} kernel connection dropped");
                        status_signal.emit(kernel.status());
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let old = self.status_watcher.lock().unwrap().replace(watcher);
        if let Some(old) = old {
            old.abort();
        }

        self.socket_changed.emit(());
        Ok(())
    }

    /// Idempotent teardown: one synthetic `Dead` emission, one disposed
    /// emission, then every signal bridge is detached. Never fails.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[session] disposing {}", self.transport.id());
        self.signals.status_changed.emit(KernelStatus::Dead);
        self.disposed_signal.emit(());
        self.bridge.lock().unwrap().dispose();
        if let Some(watcher) = self.status_watcher.lock().unwrap().take() {
            watcher.abort();
        }
    }
}

/// The session facade the rest of the system talks to. Subclass-specific
/// policy lives in `shutdown` and `wait_for_idle`; everything identity-
/// shaped delegates to the core.
#[async_trait]
pub trait KernelSessionConnection: Send + Sync {
    fn core(&self) -> &SessionConnectionCore;

    fn kind(&self) -> SessionKind {
        self.core().kind()
    }

    fn status(&self) -> KernelStatus {
        self.core().status()
    }

    async fn shutdown(&self) -> Result<(), SessionError>;

    async fn restart(&self) -> Result<(), SessionError>;

    /// Wait for the kernel to report idle. On timeout, cancellation, or
    /// disposal the session must be treated as unusable.
    async fn wait_for_idle(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<(), SessionError>;

    async fn dispose(&self);
}

/// Race the kernel-idle signal against disposal, the timeout, and the
/// caller's token. Already-idle short-circuits without waiting.
pub(crate) async fn wait_for_idle_on_session(
    core: &SessionConnectionCore,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<(), SessionError> {
    // Subscribe before sampling so a transition between the check and the
    // wait is not lost.
    let mut statuses = core.signals().status_changed.subscribe();
    let mut disposed = core.on_disposed().subscribe();

    if core.is_disposed() {
        return Err(SessionError::SessionDisposed);
    }
    if core.status() == KernelStatus::Idle {
        return Ok(());
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            status = statuses.recv() => match status {
                Ok(KernelStatus::Idle) => return Ok(()),
                Ok(KernelStatus::Dead) => return Err(SessionError::SessionDisposed),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if core.status() == KernelStatus::Idle {
                        return Ok(());
                    }
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(SessionError::SessionDisposed);
                }
            },
            _ = disposed.recv() => return Err(SessionError::SessionDisposed),
            _ = token.cancelled() => return Err(SessionError::Cancelled),
            _ = &mut deadline => return Err(SessionError::WaitForIdleTimeout(timeout)),
        }
    }
}
