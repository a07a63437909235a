//! Server-mediated session wrapper: shutdown eligibility policy, the
//! best-effort remote shutdown dance, and restart-time dependency
//! validation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use kernel_wire::{CancellationToken, Signal};
use log::{info, warn};

use crate::connection::{wait_for_idle_on_session, KernelSessionConnection, SessionConnectionCore};
use crate::error::SessionError;
use crate::providers::KernelDependencyService;
use crate::transport::SessionTransport;
use crate::types::{KernelConnectionMetadata, Resource, ResourceType, SessionKind};

const REMOTE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A session connection to a kernel behind a Jupyter server, local or
/// remote.
pub struct JupyterSessionWrapper {
    core: SessionConnectionCore,
    metadata: KernelConnectionMetadata,
    resource: Resource,
    dependencies: Arc<dyn KernelDependencyService>,
    is_shutting_down: AtomicBool,
    did_shutdown: Signal<()>,
    restart_token: StdMutex<Option<CancellationToken>>,
}

impl JupyterSessionWrapper {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        metadata: KernelConnectionMetadata,
        resource: Resource,
        dependencies: Arc<dyn KernelDependencyService>,
    ) -> Self {
        let kind = if metadata.is_local() {
            SessionKind::LocalJupyter
        } else {
            SessionKind::RemoteJupyter
        };
        Self {
            core: SessionConnectionCore::new(transport, kind),
            metadata,
            resource,
            dependencies,
            is_shutting_down: AtomicBool::new(false),
            did_shutdown: Signal::new(),
            restart_token: StdMutex::new(None),
        }
    }

    pub fn metadata(&self) -> &KernelConnectionMetadata {
        &self.metadata
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Fires exactly once, after the best-effort server shutdown attempt.
    pub fn on_did_shutdown(&self) -> &Signal<()> {
        &self.did_shutdown
    }

    /// Whether this process has authority to shut the server session
    /// down.
    ///
    /// Live remote kernels are someone else's session and are never shut
    /// down. Local connections and interactive windows always own their
    /// session. A notebook on a remote server deliberately leaves the
    /// kernel running so it survives the notebook being closed.
    pub fn can_shutdown_session(&self) -> bool {
        if matches!(
            self.metadata,
            KernelConnectionMetadata::ConnectToLiveRemoteKernel { .. }
        ) {
            return false;
        }
        if self.metadata.is_local() {
            return true;
        }
        match self.resource.resource_type {
            ResourceType::InteractiveWindow => true,
            ResourceType::Notebook => false,
        }
    }

    async fn shutdown_implementation(&self, shutdown_even_if_remote: bool) {
        if self.core.is_disposed() || self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_pending_restart_validation();

        if shutdown_even_if_remote || self.can_shutdown_session() {
            let session_id = self.core.id();
            match tokio::time::timeout(REMOTE_SHUTDOWN_TIMEOUT, self.core.transport().shutdown())
                .await
            {
                Ok(Ok(())) => info!("[session] {session_id} server shutdown complete"),
                Ok(Err(e)) => {
                    warn!("[session] {session_id} server shutdown failed: {e}");
                    self.core.transport().dispose();
                }
                Err(_) => {
                    warn!("[session] {session_id} server shutdown timed out");
                    self.core.transport().dispose();
                }
            }
            self.did_shutdown.emit(());
        }

        // Double-free guard: the transport object is torn down locally
        // whether or not the server shutdown ran.
        if !self.core.transport().is_disposed() {
            self.core.transport().dispose();
        }
        // Base disposal last: subscribers see Dead only after the
        // best-effort server shutdown was attempted.
        self.core.dispose();
    }

    fn cancel_pending_restart_validation(&self) {
        if let Some(previous) = self.restart_token.lock().unwrap().take() {
            previous.cancel();
        }
    }
}

#[async_trait]
impl KernelSessionConnection for JupyterSessionWrapper {
    fn core(&self) -> &SessionConnectionCore {
        &self.core
    }

    /// Explicit shutdown is forced: the caller has decided the session
    /// ends, so the server shutdown runs even for remote sessions the
    /// eligibility table would otherwise preserve. Only implicit
    /// teardown (`dispose`, failed idle waits) consults the table.
    async fn shutdown(&self) -> Result<(), SessionError> {
        self.shutdown_implementation(true).await;
        Ok(())
    }

    /// Local connections re-validate the kernel runtime before the
    /// restart proper; only one validation may be outstanding, so a new
    /// restart (or dispose) cancels the previous token.
    async fn restart(&self) -> Result<(), SessionError> {
        let token = CancellationToken::new();
        {
            let mut slot = self.restart_token.lock().unwrap();
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            *slot = Some(token.clone());
        }

        if self.metadata.is_local() {
            if let Some(interpreter) = self.metadata.interpreter() {
                self.dependencies
                    .ensure_kernel_is_usable(interpreter, &token)
                    .await?;
            }
        }
        self.core.restart().await
    }

    async fn wait_for_idle(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        match wait_for_idle_on_session(&self.core, timeout, token).await {
            Ok(()) => Ok(()),
            Err(original) => {
                // The session is unusable; shut it down best-effort and
                // surface the original failure.
                warn!(
                    "[session] {} wait_for_idle failed ({original}), shutting down",
                    self.core.id()
                );
                self.shutdown_implementation(false).await;
                Err(original)
            }
        }
    }

    async fn dispose(&self) {
        self.shutdown_implementation(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PythonEnvironment, ServerProviderHandle};
    use kernel_wire::KernelStatus;
    use std::sync::atomic::AtomicUsize;

    struct FakeTransport {
        signals: crate::transport::TransportSignals,
        disposed: AtomicBool,
        dispose_calls: AtomicUsize,
        shutdown_calls: AtomicUsize,
        hang_shutdown: bool,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                signals: crate::transport::TransportSignals::new(),
                disposed: AtomicBool::new(false),
                dispose_calls: AtomicUsize::new(0),
                shutdown_calls: AtomicUsize::new(0),
                hang_shutdown: false,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                signals: crate::transport::TransportSignals::new(),
                disposed: AtomicBool::new(false),
                dispose_calls: AtomicUsize::new(0),
                shutdown_calls: AtomicUsize::new(0),
                hang_shutdown: true,
            })
        }
    }

    #[async_trait]
    impl SessionTransport for FakeTransport {
        fn id(&self) -> String {
            "s1".to_string()
        }
        fn path(&self) -> String {
            "/tmp/a.ipynb".to_string()
        }
        fn name(&self) -> String {
            "a".to_string()
        }
        fn session_type(&self) -> String {
            "notebook".to_string()
        }
        fn kernel(&self) -> Option<Arc<kernel_wire::KernelConnectionProxy>> {
            None
        }
        fn is_disposed(&self) -> bool {
            self.disposed.load(Ordering::SeqCst)
        }
        fn signals(&self) -> &crate::transport::TransportSignals {
            &self.signals
        }
        async fn set_path(&self, _: &str) -> Result<(), SessionError> {
            Ok(())
        }
        async fn set_name(&self, _: &str) -> Result<(), SessionError> {
            Ok(())
        }
        async fn set_session_type(&self, _: &str) -> Result<(), SessionError> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<(), SessionError> {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_shutdown {
                futures::future::pending::<()>().await;
            }
            Ok(())
        }
        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
            self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoopDeps;

    #[async_trait]
    impl KernelDependencyService for NoopDeps {
        async fn ensure_kernel_is_usable(
            &self,
            _interpreter: &PythonEnvironment,
            _token: &CancellationToken,
        ) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn handle() -> ServerProviderHandle {
        ServerProviderHandle {
            extension_id: "ms-jupyter".into(),
            id: "server-1".into(),
            handle: "h1".into(),
        }
    }

    fn notebook() -> Resource {
        Resource {
            uri: "file:///tmp/a.ipynb".into(),
            resource_type: ResourceType::Notebook,
        }
    }

    fn interactive_window() -> Resource {
        Resource {
            uri: "vscode-interactive://1".into(),
            resource_type: ResourceType::InteractiveWindow,
        }
    }

    fn local_metadata() -> KernelConnectionMetadata {
        KernelConnectionMetadata::LocalKernelSpec {
            kernel_spec: "python3".into(),
            interpreter: None,
            server_handle: None,
        }
    }

    fn remote_metadata() -> KernelConnectionMetadata {
        KernelConnectionMetadata::RemoteKernelSpec {
            kernel_spec: "python3".into(),
            server_handle: handle(),
        }
    }

    fn wrapper(metadata: KernelConnectionMetadata, resource: Resource) -> JupyterSessionWrapper {
        JupyterSessionWrapper::new(FakeTransport::new(), metadata, resource, Arc::new(NoopDeps))
    }

    // Constructing a wrapper spawns the core's bridge tasks, so even
    // this synchronous table check needs a runtime.
    #[tokio::test]
    async fn test_shutdown_eligibility_table() {
        // Local connection, any resource: yes.
        assert!(wrapper(local_metadata(), notebook()).can_shutdown_session());
        assert!(wrapper(local_metadata(), interactive_window()).can_shutdown_session());

        // Live remote kernel: never.
        let live = KernelConnectionMetadata::ConnectToLiveRemoteKernel {
            kernel_id: "k1".into(),
            server_handle: handle(),
        };
        assert!(!wrapper(live.clone(), notebook()).can_shutdown_session());
        assert!(!wrapper(live, interactive_window()).can_shutdown_session());

        // Interactive window on a remote server: yes.
        assert!(wrapper(remote_metadata(), interactive_window()).can_shutdown_session());

        // Notebook on a remote server: no.
        assert!(!wrapper(remote_metadata(), notebook()).can_shutdown_session());
    }

    #[tokio::test]
    async fn test_shutdown_fires_did_shutdown_once() {
        let transport = FakeTransport::new();
        let session = JupyterSessionWrapper::new(
            transport.clone(),
            local_metadata(),
            notebook(),
            Arc::new(NoopDeps),
        );
        let mut did_shutdown = session.on_did_shutdown().subscribe();

        session.shutdown().await.unwrap();
        session.shutdown().await.unwrap();

        did_shutdown.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(did_shutdown.try_recv().is_err());
        assert_eq!(transport.shutdown_calls.load(Ordering::SeqCst), 1);
        assert!(session.core().is_disposed());
        assert_eq!(session.status(), KernelStatus::Dead);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_falls_back_to_local_dispose() {
        let transport = FakeTransport::hanging();
        let session = JupyterSessionWrapper::new(
            transport.clone(),
            local_metadata(),
            notebook(),
            Arc::new(NoopDeps),
        );
        let mut did_shutdown = session.on_did_shutdown().subscribe();

        session.shutdown().await.unwrap();

        did_shutdown.recv().await.unwrap();
        assert!(transport.is_disposed());
        assert!(session.core().is_disposed());
    }

    #[tokio::test]
    async fn test_explicit_shutdown_forces_remote_notebook_session_shutdown() {
        let transport = FakeTransport::new();
        let session = JupyterSessionWrapper::new(
            transport.clone(),
            remote_metadata(),
            notebook(),
            Arc::new(NoopDeps),
        );
        let mut did_shutdown = session.on_did_shutdown().subscribe();

        // Not eligible by the table, but an explicit shutdown overrides.
        assert!(!session.can_shutdown_session());
        session.shutdown().await.unwrap();

        assert_eq!(transport.shutdown_calls.load(Ordering::SeqCst), 1);
        did_shutdown.recv().await.unwrap();
        assert!(session.core().is_disposed());
    }

    #[tokio::test]
    async fn test_dispose_on_remote_notebook_preserves_server_session() {
        let transport = FakeTransport::new();
        let session = JupyterSessionWrapper::new(
            transport.clone(),
            remote_metadata(),
            notebook(),
            Arc::new(NoopDeps),
        );
        let mut did_shutdown = session.on_did_shutdown().subscribe();

        session.dispose().await;

        assert_eq!(transport.shutdown_calls.load(Ordering::SeqCst), 0);
        assert!(transport.is_disposed());
        assert!(session.core().is_disposed());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(did_shutdown.try_recv().is_err());
    }

    struct CountingDeps {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl KernelDependencyService for CountingDeps {
        async fn ensure_kernel_is_usable(
            &self,
            _interpreter: &PythonEnvironment,
            _token: &CancellationToken,
        ) -> Result<(), SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_restart_validates_local_dependencies() {
        let deps = Arc::new(CountingDeps {
            calls: AtomicUsize::new(0),
        });
        let metadata = KernelConnectionMetadata::LocalPythonEnv {
            kernel_spec: "python3".into(),
            interpreter: PythonEnvironment::Executable("/usr/bin/python3".into()),
        };
        let session =
            JupyterSessionWrapper::new(FakeTransport::new(), metadata, notebook(), deps.clone());

        // No kernel attached: the restart fails downstream, but the
        // validation must already have run.
        let result = session.restart().await;
        assert!(matches!(result, Err(SessionError::InvalidKernel)));
        assert_eq!(deps.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_restart_skips_validation() {
        let deps = Arc::new(CountingDeps {
            calls: AtomicUsize::new(0),
        });
        let session = JupyterSessionWrapper::new(
            FakeTransport::new(),
            remote_metadata(),
            notebook(),
            deps.clone(),
        );
        let _ = session.restart().await;
        assert_eq!(deps.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_wait_for_idle_shuts_down_and_rethrows() {
        let transport = FakeTransport::new();
        let session = JupyterSessionWrapper::new(
            transport.clone(),
            local_metadata(),
            notebook(),
            Arc::new(NoopDeps),
        );
        let result = session
            .wait_for_idle(Duration::from_millis(20), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SessionError::WaitForIdleTimeout(_))));
        assert!(session.core().is_disposed());
    }
}
