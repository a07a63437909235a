//! The kernel connection proxy.
//!
//! [`KernelConnectionProxy`] sits between session code and the raw wire
//! channels. It owns the reader tasks for shell and iopub, correlates
//! replies to requests by message id, fans iopub traffic out to
//! per-request routes, and tracks kernel and connection status. The
//! channels behind it can be swapped (reconnect, kernel change) without
//! consumers resubscribing: every signal object stays stable for the
//! proxy's lifetime, and so does `connection_id`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, InterruptRequest, JupyterMessage, JupyterMessageContent,
    ShutdownRequest,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{WireMessageChannel, WireSender};
use crate::signal::Signal;
use crate::socket::KernelSocket;
use crate::status::{ConnectionStatus, KernelStatus};

/// Which way a message crossed the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Send,
    Recv,
}

/// A message observed on any channel, tagged with its direction.
#[derive(Clone)]
pub struct AnyMessage {
    pub direction: MessageDirection,
    pub message: Arc<JupyterMessage>,
}

/// The kernel model a proxy is currently attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
}

/// Identity of the kernel behind a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub id: String,
    pub client_id: String,
    pub model: KernelModel,
}

/// Out-of-band kernel control: interrupt and restart run on the control
/// channel, outside the shell request/reply flow.
#[async_trait]
pub trait KernelLifecycle: Send + Sync {
    async fn interrupt(&self) -> Result<()>;
    async fn restart(&self) -> Result<()>;
}

/// Production lifecycle: opens a fresh control connection per request,
/// the same way a one-shot CLI client would.
pub struct ZmqControlLifecycle {
    connection_info: ConnectionInfo,
    session_id: String,
}

impl ZmqControlLifecycle {
    pub fn new(connection_info: ConnectionInfo, session_id: impl Into<String>) -> Self {
        Self {
            connection_info,
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl KernelLifecycle for ZmqControlLifecycle {
    async fn interrupt(&self) -> Result<()> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;
        let request: JupyterMessage = InterruptRequest {}.into();
        control.send(request).await?;
        info!("[proxy] sent interrupt_request");
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;
        let request: JupyterMessage = ShutdownRequest { restart: true }.into();
        control.send(request).await?;
        info!("[proxy] sent shutdown_request(restart=true)");
        Ok(())
    }
}

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<JupyterMessage>>>>;
type RouteMap = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<Arc<JupyterMessage>>>>>;

/// Removes a request's reply slot and iopub route when dropped.
///
/// The route stays registered for as long as the guard lives, so late
/// iopub traffic for a finished request still reaches its consumer until
/// the consumer is disposed.
pub struct RouteGuard {
    msg_id: String,
    pending: PendingMap,
    routes: RouteMap,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(&self.msg_id);
        self.routes.lock().unwrap().remove(&self.msg_id);
    }
}

/// An in-flight shell request: the reply slot, the stream of iopub
/// messages parented to it, and the guard keeping both registered.
pub struct ShellRequest {
    msg_id: String,
    reply: oneshot::Receiver<JupyterMessage>,
    messages: mpsc::UnboundedReceiver<Arc<JupyterMessage>>,
    _guard: RouteGuard,
}

impl ShellRequest {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Next iopub message parented to this request, in kernel order.
    /// `None` once the route is torn down.
    pub async fn next_message(&mut self) -> Option<Arc<JupyterMessage>> {
        self.messages.recv().await
    }

    /// Wait for the shell reply. Errors if the connection was disposed
    /// before the kernel replied.
    pub async fn reply(&mut self) -> Result<JupyterMessage> {
        (&mut self.reply)
            .await
            .map_err(|_| anyhow::anyhow!("connection closed before reply to {}", self.msg_id))
    }

    /// Decompose into reply slot, message stream, and route guard, for
    /// callers that drive them from separate places. The guard keeps the
    /// route registered for as long as it is held.
    pub fn into_parts(
        self,
    ) -> (
        String,
        oneshot::Receiver<JupyterMessage>,
        mpsc::UnboundedReceiver<Arc<JupyterMessage>>,
        RouteGuard,
    ) {
        (self.msg_id, self.reply, self.messages, self._guard)
    }
}

/// State that is swapped wholesale when the proxy is pointed at a
/// different kernel.
struct Attachment {
    info: KernelInfo,
    lifecycle: Arc<dyn KernelLifecycle>,
    shell_tx: Option<WireSender>,
    socket: Option<Arc<KernelSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct KernelConnectionProxy {
    connection_id: String,
    attachment: StdMutex<Attachment>,
    pending: PendingMap,
    routes: RouteMap,
    status: Arc<StdMutex<KernelStatus>>,
    connection_status: Arc<StdMutex<ConnectionStatus>>,
    disposed: AtomicBool,

    status_changed: Signal<KernelStatus>,
    connection_status_changed: Signal<ConnectionStatus>,
    iopub_message: Signal<Arc<JupyterMessage>>,
    unhandled_message: Signal<Arc<JupyterMessage>>,
    any_message: Signal<AnyMessage>,
}

impl KernelConnectionProxy {
    pub fn new(info: KernelInfo, lifecycle: Arc<dyn KernelLifecycle>) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            attachment: StdMutex::new(Attachment {
                info,
                lifecycle,
                shell_tx: None,
                socket: None,
                tasks: Vec::new(),
            }),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            routes: Arc::new(StdMutex::new(HashMap::new())),
            status: Arc::new(StdMutex::new(KernelStatus::Unknown)),
            connection_status: Arc::new(StdMutex::new(ConnectionStatus::Disconnected)),
            disposed: AtomicBool::new(false),
            status_changed: Signal::new(),
            connection_status_changed: Signal::new(),
            iopub_message: Signal::new(),
            unhandled_message: Signal::new(),
            any_message: Signal::new(),
        }
    }

    /// Stable id for this proxy, unchanged across reattachment.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn kernel_info(&self) -> KernelInfo {
        self.attachment.lock().unwrap().info.clone()
    }

    pub fn socket(&self) -> Option<Arc<KernelSocket>> {
        self.attachment.lock().unwrap().socket.clone()
    }

    pub fn status(&self) -> KernelStatus {
        *self.status.lock().unwrap()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.connection_status.lock().unwrap()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn on_status_changed(&self) -> &Signal<KernelStatus> {
        &self.status_changed
    }

    pub fn on_connection_status_changed(&self) -> &Signal<ConnectionStatus> {
        &self.connection_status_changed
    }

    pub fn on_iopub_message(&self) -> &Signal<Arc<JupyterMessage>> {
        &self.iopub_message
    }

    pub fn on_unhandled_message(&self) -> &Signal<Arc<JupyterMessage>> {
        &self.unhandled_message
    }

    pub fn on_any_message(&self) -> &Signal<AnyMessage> {
        &self.any_message
    }

    /// Attach wire channels for the kernel this proxy already describes.
    pub fn attach(
        &self,
        shell: WireMessageChannel,
        iopub: WireMessageChannel,
        socket: Arc<KernelSocket>,
    ) {
        if self.is_disposed() {
            warn!("[proxy] attach on disposed proxy {} ignored", self.connection_id);
            return;
        }
        let mut attachment = self.attachment.lock().unwrap();
        for task in attachment.tasks.drain(..) {
            task.abort();
        }
        attachment.shell_tx = Some(shell.sender());
        attachment.socket = Some(socket);
        attachment.tasks.push(self.spawn_shell_reader(shell));
        attachment.tasks.push(self.spawn_iopub_reader(iopub));
        drop(attachment);
        self.set_connection_status(ConnectionStatus::Connected);
    }

    /// Point the proxy at a different kernel. Signal objects and
    /// `connection_id` are untouched; subscribers stay subscribed.
    pub fn change_kernel(
        &self,
        info: KernelInfo,
        lifecycle: Arc<dyn KernelLifecycle>,
        shell: WireMessageChannel,
        iopub: WireMessageChannel,
        socket: Arc<KernelSocket>,
    ) {
        if self.is_disposed() {
            warn!(
                "[proxy] change_kernel on disposed proxy {} ignored",
                self.connection_id
            );
            return;
        }
        debug!(
            "[proxy] {} changing kernel to {}",
            self.connection_id, info.id
        );
        {
            let mut attachment = self.attachment.lock().unwrap();
            attachment.info = info;
            attachment.lifecycle = lifecycle;
        }
        // Requests in flight against the old kernel can never complete.
        self.pending.lock().unwrap().clear();
        self.routes.lock().unwrap().clear();
        self.attach(shell, iopub, socket);
    }

    /// Send an execute_request on the shell channel.
    ///
    /// The reply slot and iopub route are registered before the bytes go
    /// out, so a fast kernel cannot reply into the void.
    pub fn execute_request(
        &self,
        code: &str,
        silent: bool,
        store_history: bool,
    ) -> Result<ShellRequest> {
        let request = ExecuteRequest {
            code: code.to_string(),
            silent,
            store_history,
            user_expressions: None,
            allow_stdin: false,
            stop_on_error: true,
        };
        self.send_shell_request(request.into())
    }

    /// Send an arbitrary shell message with reply correlation and an
    /// iopub route keyed on its message id.
    pub fn send_shell_request(&self, message: JupyterMessage) -> Result<ShellRequest> {
        if self.is_disposed() {
            anyhow::bail!("connection {} is disposed", self.connection_id);
        }
        let shell_tx = self
            .attachment
            .lock()
            .unwrap()
            .shell_tx
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no shell channel attached"))?;

        let msg_id = message.header.msg_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (route_tx, route_rx) = mpsc::unbounded_channel();

        // Register before sending.
        self.pending.lock().unwrap().insert(msg_id.clone(), reply_tx);
        self.routes.lock().unwrap().insert(msg_id.clone(), route_tx);
        let guard = RouteGuard {
            msg_id: msg_id.clone(),
            pending: self.pending.clone(),
            routes: self.routes.clone(),
        };

        self.any_message.emit(AnyMessage {
            direction: MessageDirection::Send,
            message: Arc::new(message.clone()),
        });

        if let Err(e) = shell_tx.send(message) {
            // Guard drop unregisters the slots we just added.
            drop(guard);
            self.set_connection_status(ConnectionStatus::Disconnected);
            return Err(anyhow::anyhow!("shell channel closed: {e}"));
        }
        debug!("[proxy] {} sent shell request {msg_id}", self.connection_id);

        Ok(ShellRequest {
            msg_id,
            reply: reply_rx,
            messages: route_rx,
            _guard: guard,
        })
    }

    pub async fn interrupt(&self) -> Result<()> {
        let lifecycle = self.attachment.lock().unwrap().lifecycle.clone();
        lifecycle.interrupt().await
    }

    pub async fn restart(&self) -> Result<()> {
        let lifecycle = self.attachment.lock().unwrap().lifecycle.clone();
        lifecycle.restart().await
    }

    /// Tear down the proxy. Idempotent. Latches status to `Dead` and the
    /// connection to `Disconnected`, then drops all reply slots and
    /// routes so waiting consumers resolve.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[proxy] disposing {}", self.connection_id);
        let mut attachment = self.attachment.lock().unwrap();
        for task in attachment.tasks.drain(..) {
            task.abort();
        }
        attachment.shell_tx = None;
        attachment.socket = None;
        drop(attachment);
        self.pending.lock().unwrap().clear();
        self.routes.lock().unwrap().clear();
        self.set_status(KernelStatus::Dead);
        self.set_connection_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&self, status: KernelStatus) {
        let changed = {
            let mut current = self.status.lock().unwrap();
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        };
        if changed {
            self.status_changed.emit(status);
        }
    }

    fn set_connection_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut current = self.connection_status.lock().unwrap();
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        };
        if changed {
            self.connection_status_changed.emit(status);
        }
    }

    fn spawn_shell_reader(&self, mut shell: WireMessageChannel) -> JoinHandle<()> {
        let pending = self.pending.clone();
        let any_message = self.any_message.clone();
        let unhandled_message = self.unhandled_message.clone();
        let connection_status = self.connection_status.clone();
        let connection_status_changed = self.connection_status_changed.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            while let Some(message) = shell.recv().await {
                let message = Arc::new(message);
                any_message.emit(AnyMessage {
                    direction: MessageDirection::Recv,
                    message: message.clone(),
                });
                let parent_id = message
                    .parent_header
                    .as_ref()
                    .map(|h| h.msg_id.clone());
                let resolved = parent_id
                    .as_deref()
                    .and_then(|id| pending.lock().unwrap().remove(id));
                match resolved {
                    Some(slot) => {
                        let _ = slot.send((*message).clone());
                    }
                    None => {
                        debug!(
                            "[proxy] {connection_id} unhandled shell message type={} parent={:?}",
                            message.header.msg_type, parent_id
                        );
                        unhandled_message.emit(message);
                    }
                }
            }
            mark_disconnected(&connection_status, &connection_status_changed);
            debug!("[proxy] {connection_id} shell reader ended");
        })
    }

    fn spawn_iopub_reader(&self, mut iopub: WireMessageChannel) -> JoinHandle<()> {
        let routes = self.routes.clone();
        let status = self.status.clone();
        let status_changed = self.status_changed.clone();
        let iopub_message = self.iopub_message.clone();
        let any_message = self.any_message.clone();
        let connection_status = self.connection_status.clone();
        let connection_status_changed = self.connection_status_changed.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            while let Some(message) = iopub.recv().await {
                let message = Arc::new(message);
                any_message.emit(AnyMessage {
                    direction: MessageDirection::Recv,
                    message: message.clone(),
                });

                if let JupyterMessageContent::Status(s) = &message.content {
                    let new_status = KernelStatus::from(s.execution_state.clone());
                    let changed = {
                        let mut current = status.lock().unwrap();
                        if *current == new_status {
                            false
                        } else {
                            *current = new_status;
                            true
                        }
                    };
                    if changed {
                        status_changed.emit(new_status);
                    }
                }

                if let Some(parent_id) = message.parent_header.as_ref().map(|h| &h.msg_id) {
                    let route = routes.lock().unwrap().get(parent_id).cloned();
                    if let Some(route) = route {
                        let _ = route.send(message.clone());
                    }
                }
                iopub_message.emit(message);
            }
            mark_disconnected(&connection_status, &connection_status_changed);
            debug!("[proxy] {connection_id} iopub reader ended");
        })
    }
}

fn mark_disconnected(
    cache: &Arc<StdMutex<ConnectionStatus>>,
    signal: &Signal<ConnectionStatus>,
) {
    let changed = {
        let mut current = cache.lock().unwrap();
        if *current == ConnectionStatus::Disconnected {
            false
        } else {
            *current = ConnectionStatus::Disconnected;
            true
        }
    };
    if changed {
        signal.emit(ConnectionStatus::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::KernelSocketRegistry;
    use jupyter_protocol::{ExecutionState, KernelInfoRequest, Status};
    use std::time::Duration;

    struct NoopLifecycle {
        interrupts: StdMutex<usize>,
    }

    impl NoopLifecycle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                interrupts: StdMutex::new(0),
            })
        }
    }

    #[async_trait]
    impl KernelLifecycle for NoopLifecycle {
        async fn interrupt(&self) -> Result<()> {
            *self.interrupts.lock().unwrap() += 1;
            Ok(())
        }
        async fn restart(&self) -> Result<()> {
            Ok(())
        }
    }

    fn kernel_info(id: &str) -> KernelInfo {
        KernelInfo {
            id: id.to_string(),
            client_id: "client-1".to_string(),
            model: KernelModel {
                id: id.to_string(),
                name: "python3".to_string(),
            },
        }
    }

    struct Harness {
        proxy: Arc<KernelConnectionProxy>,
        shell_peer: WireMessageChannel,
        iopub_peer: WireMessageChannel,
        registry: KernelSocketRegistry,
    }

    fn attach_proxy(id: &str) -> Harness {
        let proxy = Arc::new(KernelConnectionProxy::new(
            kernel_info(id),
            NoopLifecycle::new(),
        ));
        let registry = KernelSocketRegistry::new();
        let (shell, shell_peer) = WireMessageChannel::pair();
        let (iopub, iopub_peer) = WireMessageChannel::pair();
        let socket = registry.register(id);
        proxy.attach(shell, iopub, socket);
        Harness {
            proxy,
            shell_peer,
            iopub_peer,
            registry,
        }
    }

    fn busy_status(parent: &JupyterMessage) -> JupyterMessage {
        Status {
            execution_state: ExecutionState::Busy,
        }
        .as_child_of(parent)
    }

    fn child_message(
        msg_type: &str,
        content: serde_json::Value,
        parent: &JupyterMessage,
    ) -> JupyterMessage {
        let content = JupyterMessageContent::from_type_and_content(msg_type, content).unwrap();
        JupyterMessage::new(content, Some(parent))
    }

    #[tokio::test]
    async fn test_execute_request_routes_reply_and_iopub() {
        let mut h = attach_proxy("k1");
        let mut request = h.proxy.execute_request("1 + 1", true, false).unwrap();

        // Fake kernel: receive the request, stream output, then reply.
        let sent = h.shell_peer.recv().await.unwrap();
        assert_eq!(sent.header.msg_id, request.msg_id());

        let stream = child_message(
            "stream",
            serde_json::json!({"name": "stdout", "text": "2"}),
            &sent,
        );
        h.iopub_peer.send(stream).unwrap();
        let routed = request.next_message().await.unwrap();
        assert_eq!(routed.header.msg_type, "stream");

        let reply = child_message(
            "execute_reply",
            serde_json::json!({"status": "ok", "execution_count": 1}),
            &sent,
        );
        h.shell_peer.send(reply).unwrap();
        let reply = request.reply().await.unwrap();
        assert_eq!(reply.header.msg_type, "execute_reply");
    }

    #[tokio::test]
    async fn test_status_signal_follows_iopub_status() {
        let h = attach_proxy("k1");
        assert_eq!(h.proxy.status(), KernelStatus::Unknown);

        let mut statuses = h.proxy.on_status_changed().subscribe();
        let parent: JupyterMessage = KernelInfoRequest::default().into();
        h.iopub_peer.send(busy_status(&parent)).unwrap();

        assert_eq!(statuses.recv().await.unwrap(), KernelStatus::Busy);
        assert_eq!(h.proxy.status(), KernelStatus::Busy);
    }

    #[tokio::test]
    async fn test_reply_without_pending_entry_is_unhandled() {
        let h = attach_proxy("k1");
        let mut unhandled = h.proxy.on_unhandled_message().subscribe();

        let stray: JupyterMessage = KernelInfoRequest::default().into();
        h.shell_peer.send(stray.clone()).unwrap();

        let seen = unhandled.recv().await.unwrap();
        assert_eq!(seen.header.msg_id, stray.header.msg_id);
    }

    #[tokio::test]
    async fn test_channel_close_marks_disconnected() {
        let h = attach_proxy("k1");
        let mut conn = h.proxy.on_connection_status_changed().subscribe();
        drop(h.shell_peer);
        drop(h.iopub_peer);
        assert_eq!(conn.recv().await.unwrap(), ConnectionStatus::Disconnected);
        assert_eq!(h.proxy.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_change_kernel_keeps_connection_id_and_signals() {
        let h = attach_proxy("k1");
        let id_before = h.proxy.connection_id().to_string();
        let mut statuses = h.proxy.on_status_changed().subscribe();

        let (shell, shell_peer) = WireMessageChannel::pair();
        let (iopub, iopub_peer) = WireMessageChannel::pair();
        let socket = h.registry.register("k2");
        h.proxy
            .change_kernel(kernel_info("k2"), NoopLifecycle::new(), shell, iopub, socket);

        assert_eq!(h.proxy.connection_id(), id_before);
        assert_eq!(h.proxy.kernel_info().id, "k2");

        // The pre-existing subscription still sees the new kernel's status.
        let parent: JupyterMessage = KernelInfoRequest::default().into();
        iopub_peer.send(busy_status(&parent)).unwrap();
        assert_eq!(statuses.recv().await.unwrap(), KernelStatus::Busy);
        drop(shell_peer);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_latches_dead() {
        let h = attach_proxy("k1");
        let mut statuses = h.proxy.on_status_changed().subscribe();
        h.proxy.dispose();
        h.proxy.dispose();
        assert!(h.proxy.is_disposed());
        assert_eq!(h.proxy.status(), KernelStatus::Dead);
        assert_eq!(statuses.recv().await.unwrap(), KernelStatus::Dead);
        // Second dispose emitted nothing further.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(statuses.try_recv().is_err());
        assert!(h.proxy.execute_request("x", true, false).is_err());
    }

    #[tokio::test]
    async fn test_any_message_tags_direction() {
        let mut h = attach_proxy("k1");
        let mut any = h.proxy.on_any_message().subscribe();
        let _request = h.proxy.execute_request("1", true, false).unwrap();

        let observed = any.recv().await.unwrap();
        assert_eq!(observed.direction, MessageDirection::Send);

        let sent = h.shell_peer.recv().await.unwrap();
        h.iopub_peer.send(busy_status(&sent)).unwrap();
        let observed = any.recv().await.unwrap();
        assert_eq!(observed.direction, MessageDirection::Recv);
    }

    #[tokio::test]
    async fn test_interrupt_delegates_to_lifecycle() {
        let lifecycle = NoopLifecycle::new();
        let proxy = KernelConnectionProxy::new(kernel_info("k1"), lifecycle.clone());
        proxy.interrupt().await.unwrap();
        proxy.interrupt().await.unwrap();
        assert_eq!(*lifecycle.interrupts.lock().unwrap(), 2);
    }
}
