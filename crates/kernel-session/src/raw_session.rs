//! Direct-process kernel session wrapper.
//!
//! Raw sessions own their kernel process outright, so shutdown is always
//! eligible and restarts need no dependency validation. Idle-wait policy
//! matches the server-mediated wrapper: a failed wait shuts the session
//! down and rethrows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kernel_wire::{CancellationToken, Signal};
use log::{info, warn};

use crate::connection::{wait_for_idle_on_session, KernelSessionConnection, SessionConnectionCore};
use crate::error::SessionError;
use crate::transport::SessionTransport;
use crate::types::SessionKind;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct RawSessionWrapper {
    core: SessionConnectionCore,
    is_shutting_down: AtomicBool,
    did_shutdown: Signal<()>,
}

impl RawSessionWrapper {
    pub fn new(transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            core: SessionConnectionCore::new(transport, SessionKind::LocalRaw),
            is_shutting_down: AtomicBool::new(false),
            did_shutdown: Signal::new(),
        }
    }

    pub fn on_did_shutdown(&self) -> &Signal<()> {
        &self.did_shutdown
    }

    async fn shutdown_implementation(&self) {
        if self.core.is_disposed() || self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let session_id = self.core.id();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.core.transport().shutdown()).await {
            Ok(Ok(())) => info!("[session] {session_id} kernel process shutdown complete"),
            Ok(Err(e)) => {
                warn!("[session] {session_id} kernel process shutdown failed: {e}");
                self.core.transport().dispose();
            }
            Err(_) => {
                warn!("[session] {session_id} kernel process shutdown timed out");
                self.core.transport().dispose();
            }
        }
        self.did_shutdown.emit(());

        if !self.core.transport().is_disposed() {
            self.core.transport().dispose();
        }
        self.core.dispose();
    }
}

#[async_trait]
impl KernelSessionConnection for RawSessionWrapper {
    fn core(&self) -> &SessionConnectionCore {
        &self.core
    }

    async fn shutdown(&self) -> Result<(), SessionError> {
        self.shutdown_implementation().await;
        Ok(())
    }

    async fn restart(&self) -> Result<(), SessionError> {
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
                warn!(
                    "[session] {} wait_for_idle failed ({original}), shutting down",
                    self.core.id()
                );
                self.shutdown_implementation().await;
                Err(original)
            }
        }
    }

    async fn dispose(&self) {
        self.shutdown_implementation().await;
    }
}
