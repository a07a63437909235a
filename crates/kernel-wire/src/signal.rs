//! Broadcast-backed signals and the bridge helper that proxies them.
//!
//! A [`Signal`] is a lightweight multi-subscriber event channel. Emission
//! never fails: with no subscribers the value is simply dropped, matching
//! how a UI-facing event emitter behaves. Per-signal ordering follows the
//! underlying broadcast channel, so a bridged signal re-emits in exactly
//! the order the source emitted.
//!
//! [`SignalBridge`] owns the forwarding tasks that mirror one signal onto
//! another. All bindings are registered through the same two helpers and
//! torn down by a single `dispose()`, so the connect/disconnect pairing
//! cannot drift when another channel is added.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const SIGNAL_CAPACITY: usize = 256;

/// A multi-subscriber event channel.
pub struct Signal<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(SIGNAL_CAPACITY);
        Self { tx }
    }

    /// Emit a value to all current subscribers.
    pub fn emit(&self, value: T) {
        // No subscribers is not an error.
        let _ = self.tx.send(value);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Owns the forwarding tasks that mirror source signals onto target
/// signals. Dropping or disposing the bridge detaches every binding.
pub struct SignalBridge {
    tasks: Vec<JoinHandle<()>>,
}

impl SignalBridge {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Mirror every emission of `source` onto `target`, 1:1 and in order.
    pub fn forward<T: Clone + Send + 'static>(
        &mut self,
        mut source: broadcast::Receiver<T>,
        target: Signal<T>,
    ) {
        self.tasks.push(tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(value) => target.emit(value),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Like [`SignalBridge::forward`], but runs `tap` on each value before
    /// re-emitting it (used for the unhandled-message diagnostic log).
    pub fn forward_with<T, F>(
        &mut self,
        mut source: broadcast::Receiver<T>,
        target: Signal<T>,
        mut tap: F,
    ) where
        T: Clone + Send + 'static,
        F: FnMut(&T) + Send + 'static,
    {
        self.tasks.push(tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(value) => {
                        tap(&value);
                        target.emit(value);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Detach every binding. Safe to call more than once.
    pub fn dispose(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Default for SignalBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A cancellation token for long-running waits.
///
/// Cloned tokens share the same cancelled state. Cancellation is latched:
/// once cancelled, a token never becomes uncancelled.
#[derive(Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        // send() drops the value when no receiver exists; the latch must
        // stick even while nobody is awaiting it.
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // All senders gone without cancelling; wait forever.
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
