//! Reconnect supervision across all live kernels.
//!
//! The [`AutoReconnectMonitor`] watches every kernel's connection status
//! and decides between "show a reconnecting indicator and wait" and
//! "the remote server is gone, give up". Restarts produce expected
//! transient disconnects, so all handling is suppressed between
//! `on_will_restart` and `on_restart_completed`.
//!
//! Bookkeeping lives in explicit side tables keyed by stable string ids
//! and is removed on `on_kernel_disposed`, so disposed kernels are never
//! retained.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use kernel_wire::{ConnectionStatus, KernelConnectionProxy};
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::providers::{Disposable, MonitoredKernel, ReconnectUi, ServerProviderRegistry, ServerUriStorage};
use crate::types::CellRef;

#[derive(Default)]
struct ReconnectState {
    restarting: bool,
    last_executing_cell: Option<CellRef>,
    progress: Option<Box<dyn Disposable>>,
}

pub struct AutoReconnectMonitor {
    servers: Arc<dyn ServerProviderRegistry>,
    uri_storage: Arc<dyn ServerUriStorage>,
    ui: Arc<dyn ReconnectUi>,
    // Keyed by logical kernel id.
    states: StdMutex<HashMap<String, ReconnectState>>,
    // Connection-status events arrive keyed by connection, and a restart
    // swaps the connection object under the same logical kernel.
    kernels_by_connection: StdMutex<HashMap<String, Arc<dyn MonitoredKernel>>>,
    watchers: StdMutex<HashMap<String, JoinHandle<()>>>,
}

impl AutoReconnectMonitor {
    pub fn new(
        servers: Arc<dyn ServerProviderRegistry>,
        uri_storage: Arc<dyn ServerUriStorage>,
        ui: Arc<dyn ReconnectUi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            servers,
            uri_storage,
            ui,
            states: StdMutex::new(HashMap::new()),
            kernels_by_connection: StdMutex::new(HashMap::new()),
            watchers: StdMutex::new(HashMap::new()),
        })
    }

    /// Begin tracking a kernel after its first successful start.
    ///
    /// Safe to call again after a restart with the new connection; the
    /// old watcher is replaced and the old connection mapping stays until
    /// disposal (stale entries are harmless, their events stop).
    pub fn on_kernel_started(
        self: &Arc<Self>,
        kernel: Arc<dyn MonitoredKernel>,
        connection: &Arc<KernelConnectionProxy>,
    ) {
        let kernel_id = kernel.id();
        self.kernels_by_connection
            .lock()
            .unwrap()
            .insert(connection.connection_id().to_string(), kernel);
        self.states
            .lock()
            .unwrap()
            .entry(kernel_id.clone())
            .or_default();

        let monitor = self.clone();
        let connection_id = connection.connection_id().to_string();
        let mut status_rx = connection.on_connection_status_changed().subscribe();
        let watcher = tokio::spawn(async move {
            loop {
                match status_rx.recv().await {
                    Ok(status) => {
                        // Events arrive keyed by connection; the table
                        // maps them back to the logical kernel. A missing
                        // entry means the kernel was disposed.
                        let kernel = monitor
                            .kernels_by_connection
                            .lock()
                            .unwrap()
                            .get(&connection_id)
                            .cloned();
                        match kernel {
                            Some(kernel) => {
                                monitor.handle_connection_status(&kernel, status).await
                            }
                            None => break,
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.watchers.lock().unwrap().insert(kernel_id, watcher) {
            old.abort();
        }
    }

    /// Suppress reconnect handling for the duration of a restart.
    pub fn on_will_restart(&self, kernel_id: &str) {
        let progress = {
            let mut states = self.states.lock().unwrap();
            match states.get_mut(kernel_id) {
                Some(state) => {
                    state.restarting = true;
                    state.progress.take()
                }
                None => None,
            }
        };
        dispose_progress(progress);
    }

    pub fn on_restart_completed(&self, kernel_id: &str) {
        if let Some(state) = self.states.lock().unwrap().get_mut(kernel_id) {
            state.restarting = false;
        }
    }

    /// Drop all bookkeeping for a kernel. Active progress is released.
    pub fn on_kernel_disposed(&self, kernel_id: &str) {
        let progress = self
            .states
            .lock()
            .unwrap()
            .remove(kernel_id)
            .and_then(|mut state| state.progress.take());
        dispose_progress(progress);
        if let Some(watcher) = self.watchers.lock().unwrap().remove(kernel_id) {
            watcher.abort();
        }
        self.kernels_by_connection
            .lock()
            .unwrap()
            .retain(|_, kernel| kernel.id() != kernel_id);
    }

    /// Remember which cell a kernel is executing, for inline error
    /// annotation when the connection later drops for good.
    pub fn on_cell_executing(&self, kernel_id: &str, cell: CellRef) {
        if let Some(state) = self.states.lock().unwrap().get_mut(kernel_id) {
            state.last_executing_cell = Some(cell);
        }
    }

    pub fn on_cell_execution_idle(&self, kernel_id: &str) {
        if let Some(state) = self.states.lock().unwrap().get_mut(kernel_id) {
            state.last_executing_cell = None;
        }
    }

    pub async fn handle_connection_status(
        &self,
        kernel: &Arc<dyn MonitoredKernel>,
        status: ConnectionStatus,
    ) {
        let kernel_id = kernel.id();
        enum Action {
            Nothing,
            CheckLiveness { had_progress: bool },
        }
        let action = {
            let mut states = self.states.lock().unwrap();
            let state = match states.get_mut(&kernel_id) {
                Some(state) => state,
                None => return,
            };
            if state.restarting {
                debug!("[reconnect] {kernel_id} {status} during restart, ignoring");
                Action::Nothing
            } else {
                match status {
                    ConnectionStatus::Connected => {
                        dispose_progress(state.progress.take());
                        Action::Nothing
                    }
                    ConnectionStatus::Disconnected => {
                        if state.progress.is_some() {
                            dispose_progress(state.progress.take());
                            Action::CheckLiveness { had_progress: true }
                        } else {
                            Action::Nothing
                        }
                    }
                    ConnectionStatus::Connecting => {
                        if state.progress.is_some() {
                            Action::Nothing
                        } else {
                            Action::CheckLiveness { had_progress: false }
                        }
                    }
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::CheckLiveness { had_progress } => {
                if self.is_server_still_listed(kernel).await {
                    if !had_progress {
                        let progress = self.ui.begin_reconnect_progress(&kernel.display_name());
                        let mut states = self.states.lock().unwrap();
                        match states.get_mut(&kernel_id) {
                            // The kernel could have been disposed or
                            // reconnected while the liveness check ran.
                            Some(state) if state.progress.is_none() && !state.restarting => {
                                state.progress = Some(progress);
                            }
                            _ => dispose_progress(Some(progress)),
                        }
                    }
                } else {
                    self.handle_server_gone(kernel).await;
                }
            }
        }
    }

    /// Whether the remote server behind this kernel is still listed by
    /// its provider. Inconclusive checks fail open: a provider error or
    /// an unknown provider must never evict a server.
    async fn is_server_still_listed(&self, kernel: &Arc<dyn MonitoredKernel>) -> bool {
        let metadata = kernel.metadata();
        let handle = match metadata.server_handle() {
            Some(handle) => handle.clone(),
            None => return true,
        };
        match self.servers.list_server_handles(&handle).await {
            Ok(Some(handles)) => handles.contains(&handle.handle),
            Ok(None) => {
                warn!(
                    "[reconnect] no provider {} for kernel {}, assuming server alive",
                    handle.extension_id,
                    kernel.id()
                );
                true
            }
            Err(e) => {
                warn!(
                    "[reconnect] liveness check failed for kernel {}: {e}, assuming server alive",
                    kernel.id()
                );
                true
            }
        }
    }

    /// The server is confirmed gone: evict its URI, surface the terminal
    /// crash error, and dispose the kernel.
    async fn handle_server_gone(&self, kernel: &Arc<dyn MonitoredKernel>) {
        let kernel_id = kernel.id();
        info!("[reconnect] server for kernel {kernel_id} is gone, giving up");
        if let Some(handle) = kernel.metadata().server_handle().cloned() {
            if let Err(e) = self.uri_storage.remove(&handle).await {
                warn!("[reconnect] failed to evict server uri: {e}");
            }
        }
        let last_cell = self
            .states
            .lock()
            .unwrap()
            .get(&kernel_id)
            .and_then(|state| state.last_executing_cell.clone());
        self.ui
            .show_kernel_crash_error(&kernel.display_name(), last_cell.as_ref());
        kernel.dispose().await;
        self.on_kernel_disposed(&kernel_id);
    }
}

fn dispose_progress(progress: Option<Box<dyn Disposable>>) {
    if let Some(progress) = progress {
        progress.dispose();
    }
}
