//! Per-submission execution state machine.
//!
//! A [`CodeExecutionRequest`] binds to one session at `start()` time and
//! walks `Pending → Started → {Completed, Failed, Cancelled}`. The
//! outcome settles exactly once; `done()` can be awaited from any number
//! of places. The underlying shell route is deliberately kept registered
//! after the reply arrives — kernels with background threads keep
//! publishing on iopub after execute_reply, and those messages must still
//! reach the output emitter until the request itself is disposed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use jupyter_protocol::{JupyterMessage, JupyterMessageContent, ReplyStatus};
use kernel_wire::{KernelConnectionProxy, RouteGuard, Signal};
use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::KernelSessionConnection;
use crate::error::{KernelFailure, SessionError};

/// Allocates execution ids, one monotonic counter per submitting
/// extension, formatted `{extension_id}-{n}`.
pub struct ExecutionIdFactory {
    counters: StdMutex<HashMap<String, u64>>,
}

impl ExecutionIdFactory {
    pub fn new() -> Self {
        Self {
            counters: StdMutex::new(HashMap::new()),
        }
    }

    pub fn next(&self, extension_id: &str) -> String {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(extension_id.to_string()).or_insert(0);
        *counter += 1;
        format!("{extension_id}-{counter}")
    }
}

impl Default for ExecutionIdFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Started,
    Completed,
    Failed,
    Cancelled,
}

/// How a settled request ended, for the non-error outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Completed,
    Cancelled,
}

type Outcome = Result<CompletionKind, SessionError>;

struct StartedState {
    kernel: Arc<KernelConnectionProxy>,
    guard: Option<RouteGuard>,
    driver: Option<JoinHandle<()>>,
}

pub struct CodeExecutionRequest {
    execution_id: String,
    code: String,
    trusted_caller: bool,
    cancel_requested: Arc<AtomicBool>,
    disposed: AtomicBool,
    started: StdMutex<Option<StartedState>>,
    outcome: Arc<watch::Sender<Option<Outcome>>>,
    request_sent: Signal<String>,
    request_acknowledged: Signal<String>,
    output: Signal<Arc<JupyterMessage>>,
}

impl CodeExecutionRequest {
    /// `trusted_caller` marks submissions from the host's own internal
    /// code path; cancellation then detaches without interrupting the
    /// kernel.
    pub fn new(execution_id: String, code: impl Into<String>, trusted_caller: bool) -> Self {
        let (outcome, _rx) = watch::channel(None);
        Self {
            execution_id,
            code: code.into(),
            trusted_caller,
            cancel_requested: Arc::new(AtomicBool::new(false)),
            disposed: AtomicBool::new(false),
            started: StdMutex::new(None),
            outcome: Arc::new(outcome),
            request_sent: Signal::new(),
            request_acknowledged: Signal::new(),
            output: Signal::new(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Fires once, with the wire msg_id, when the request goes out.
    pub fn on_request_sent(&self) -> &Signal<String> {
        &self.request_sent
    }

    /// Fires once, after `request_sent`, when the kernel first reacts.
    pub fn on_request_acknowledged(&self) -> &Signal<String> {
        &self.request_acknowledged
    }

    /// Every iopub message parented to this execution, in arrival order.
    pub fn on_did_emit_output(&self) -> &Signal<Arc<JupyterMessage>> {
        &self.output
    }

    pub fn status(&self) -> ExecutionStatus {
        if let Some(outcome) = self.outcome.borrow().clone() {
            return match outcome {
                Ok(CompletionKind::Completed) => ExecutionStatus::Completed,
                Ok(CompletionKind::Cancelled) => ExecutionStatus::Cancelled,
                Err(_) => ExecutionStatus::Failed,
            };
        }
        if self.started.lock().unwrap().is_some() {
            ExecutionStatus::Started
        } else {
            ExecutionStatus::Pending
        }
    }

    /// Submit the code to the session's kernel.
    ///
    /// Silently does nothing when cancellation already happened. A second
    /// call is a logic bug upstream: it is logged and ignored rather than
    /// double-submitting to the kernel.
    pub fn start(&self, session: &dyn KernelSessionConnection) {
        if self.cancel_requested.load(Ordering::SeqCst) {
            debug!(
                "[execution] {} cancelled before start, skipping submit",
                self.execution_id
            );
            return;
        }

        let mut started = self.started.lock().unwrap();
        if started.is_some() {
            error!(
                "[execution] {} started twice, ignoring second submit",
                self.execution_id
            );
            return;
        }

        let core = session.core();
        let kernel = match core.transport().kernel() {
            Some(kernel) if !kernel.is_disposed() && !core.is_disposed() => kernel,
            _ => {
                self.settle(Err(SessionError::SessionDisposed));
                return;
            }
        };

        // Silent, no history: the submission must not perturb the
        // kernel's visible execution counters.
        let request = match kernel.execute_request(&self.code, true, false) {
            Ok(request) => request,
            Err(e) => {
                self.settle(Err(SessionError::Transport(e.to_string())));
                return;
            }
        };
        let (msg_id, reply_rx, messages, guard) = request.into_parts();

        self.request_sent.emit(msg_id);
        let driver = tokio::spawn(drive(
            self.execution_id.clone(),
            reply_rx,
            messages,
            self.request_acknowledged.clone(),
            self.output.clone(),
            self.outcome.clone(),
            self.cancel_requested.clone(),
        ));
        *started = Some(StartedState {
            kernel,
            guard: Some(guard),
            driver: Some(driver),
        });
    }

    /// Resolves or fails exactly once: success, kernel error, or
    /// cancellation.
    pub async fn done(&self) -> Outcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(SessionError::SessionDisposed);
            }
        }
    }

    /// Cancel the execution. No-op when already cancelled or settled.
    ///
    /// A started request interrupts the kernel first (skipped for
    /// trusted callers, and interrupt failures are swallowed), then the
    /// shell route is torn down and the in-flight machinery is awaited
    /// before the outcome settles as cancelled.
    pub async fn cancel(&self) {
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.outcome.borrow().is_some() {
            return;
        }

        let (kernel, guard, driver) = {
            let mut started = self.started.lock().unwrap();
            match started.as_mut() {
                Some(state) => (
                    Some(state.kernel.clone()),
                    state.guard.take(),
                    state.driver.take(),
                ),
                None => (None, None, None),
            }
        };

        if let Some(kernel) = kernel {
            if self.trusted_caller {
                debug!(
                    "[execution] {} trusted caller, detaching without interrupt",
                    self.execution_id
                );
            } else if let Err(e) = kernel.interrupt().await {
                warn!("[execution] {} interrupt failed: {e}", self.execution_id);
            }
        }

        // Closing the route drains the driver; wait for it so the
        // underlying request has fully wound down before we settle.
        drop(guard);
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        self.settle(Ok(CompletionKind::Cancelled));
    }

    /// Idempotent; releases the output route. A request disposed before
    /// reaching any terminal state settles as disposed.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let guard = {
            let mut started = self.started.lock().unwrap();
            started.as_mut().and_then(|state| state.guard.take())
        };
        drop(guard);
        self.settle(Err(SessionError::SessionDisposed));
    }

    fn settle(&self, outcome: Outcome) {
        settle(&self.outcome, outcome);
    }
}

fn settle(slot: &watch::Sender<Option<Outcome>>, outcome: Outcome) {
    slot.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(outcome);
            true
        } else {
            false
        }
    });
}

async fn drive(
    execution_id: String,
    mut reply_rx: oneshot::Receiver<JupyterMessage>,
    mut messages: mpsc::UnboundedReceiver<Arc<JupyterMessage>>,
    request_acknowledged: Signal<String>,
    output: Signal<Arc<JupyterMessage>>,
    outcome: Arc<watch::Sender<Option<Outcome>>>,
    cancel_requested: Arc<AtomicBool>,
) {
    let mut reply_pending = true;
    let mut acknowledged = false;
    loop {
        tokio::select! {
            reply = &mut reply_rx, if reply_pending => {
                reply_pending = false;
                match reply {
                    Ok(message) => settle(&outcome, outcome_of_reply(&message)),
                    Err(_) => {
                        // The connection went away. During cancellation
                        // that is expected; the cancel path settles.
                        if !cancel_requested.load(Ordering::SeqCst) {
                            settle(&outcome, Err(SessionError::SessionDisposed));
                        }
                    }
                }
            }
            message = messages.recv() => match message {
                Some(message) => {
                    if !acknowledged {
                        acknowledged = true;
                        request_acknowledged.emit(execution_id.clone());
                    }
                    output.emit(message);
                }
                None => break,
            }
        }
    }
    debug!("[execution] {execution_id} route closed");
}

fn outcome_of_reply(message: &JupyterMessage) -> Outcome {
    let is_error = matches!(
        &message.content,
        JupyterMessageContent::ExecuteReply(reply) if reply.status == ReplyStatus::Error
    );
    if !is_error {
        return Ok(CompletionKind::Completed);
    }
    Err(SessionError::Kernel(kernel_failure_of(&message.content)))
}

/// Pull ename/evalue/traceback out of an error reply. The protocol has
/// carried these both top-level and nested under `error`, so both shapes
/// are accepted.
fn kernel_failure_of(content: &JupyterMessageContent) -> KernelFailure {
    let value = serde_json::to_value(content).unwrap_or_default();
    let source = if value.get("ename").is_some() {
        &value
    } else {
        value.get("error").unwrap_or(&value)
    };
    KernelFailure {
        ename: source
            .get("ename")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string(),
        evalue: source
            .get("evalue")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        traceback: source
            .get("traceback")
            .and_then(|v| v.as_array())
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|line| line.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    }
}
