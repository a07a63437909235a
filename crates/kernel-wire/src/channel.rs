//! Transport-agnostic message channels.
//!
//! A [`WireMessageChannel`] is a duplex stream of [`JupyterMessage`]s. The
//! consumer never sees the transport behind it: the same API covers a ZMQ
//! connection to a live kernel and an in-memory pair used by tests and
//! fakes. Closing the underlying transport surfaces as `recv()` returning
//! `None`; it is never an error.

use jupyter_protocol::{ConnectionInfo, JupyterMessage};
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The channel's peer is gone and the message was not delivered.
#[derive(Debug, Error)]
#[error("wire channel closed")]
pub struct ChannelClosed(pub Box<JupyterMessage>);

/// Sending half of a wire channel. Cheap to clone; sends never block.
#[derive(Clone)]
pub struct WireSender {
    tx: mpsc::UnboundedSender<JupyterMessage>,
}

impl WireSender {
    pub fn send(&self, message: JupyterMessage) -> Result<(), ChannelClosed> {
        self.tx
            .send(message)
            .map_err(|e| ChannelClosed(Box::new(e.0)))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a wire channel.
pub struct WireReceiver {
    rx: mpsc::UnboundedReceiver<JupyterMessage>,
}

impl WireReceiver {
    /// Receive the next message. `None` means the channel is closed.
    pub async fn recv(&mut self) -> Option<JupyterMessage> {
        self.rx.recv().await
    }
}

/// A duplex message stream over an unspecified transport.
pub struct WireMessageChannel {
    sender: WireSender,
    receiver: WireReceiver,
    pumps: Vec<JoinHandle<()>>,
}

impl WireMessageChannel {
    /// Two channels wired back to back: whatever one sends, the other
    /// receives. Used by tests and fake transports.
    pub fn pair() -> (WireMessageChannel, WireMessageChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = WireMessageChannel {
            sender: WireSender { tx: b_tx },
            receiver: WireReceiver { rx: a_rx },
            pumps: Vec::new(),
        };
        let b = WireMessageChannel {
            sender: WireSender { tx: a_tx },
            receiver: WireReceiver { rx: b_rx },
            pumps: Vec::new(),
        };
        (a, b)
    }

    /// Open the shell channel of a kernel over ZMQ.
    ///
    /// Uses a deterministic dealer identity derived from the session id so
    /// that a reconnecting client picks up replies addressed to it.
    pub async fn zmq_shell(
        connection_info: &ConnectionInfo,
        session_id: &str,
    ) -> anyhow::Result<WireMessageChannel> {
        let identity = runtimelib::peer_identity_for_session(session_id)?;
        let shell = runtimelib::create_client_shell_connection_with_identity(
            connection_info,
            session_id,
            identity,
        )
        .await?;
        let (mut shell_writer, mut shell_reader) = shell.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<JupyterMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<JupyterMessage>();

        let writer_pump = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = shell_writer.send(message).await {
                    warn!("[wire] shell write failed: {e}");
                    break;
                }
            }
        });
        let reader_pump = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(message) => {
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("[wire] shell read ended: {e}");
                        break;
                    }
                }
            }
        });

        Ok(WireMessageChannel {
            sender: WireSender { tx: out_tx },
            receiver: WireReceiver { rx: in_rx },
            pumps: vec![writer_pump, reader_pump],
        })
    }

    /// Subscribe to the iopub channel of a kernel over ZMQ.
    ///
    /// Iopub is receive-only: sends on the returned channel fail with
    /// [`ChannelClosed`].
    pub async fn zmq_iopub(
        connection_info: &ConnectionInfo,
        session_id: &str,
    ) -> anyhow::Result<WireMessageChannel> {
        let mut iopub =
            runtimelib::create_client_iopub_connection(connection_info, "", session_id).await?;

        let (out_tx, out_rx) = mpsc::unbounded_channel::<JupyterMessage>();
        // Receive-only: drop the outbound receiver so sends error out.
        drop(out_rx);
        let (in_tx, in_rx) = mpsc::unbounded_channel::<JupyterMessage>();

        let reader_pump = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("[wire] iopub read ended: {e}");
                        break;
                    }
                }
            }
        });

        Ok(WireMessageChannel {
            sender: WireSender { tx: out_tx },
            receiver: WireReceiver { rx: in_rx },
            pumps: vec![reader_pump],
        })
    }

    pub fn sender(&self) -> WireSender {
        self.sender.clone()
    }

    /// Receive the next message. `None` means the channel is closed.
    pub async fn recv(&mut self) -> Option<JupyterMessage> {
        self.receiver.recv().await
    }

    pub fn send(&self, message: JupyterMessage) -> Result<(), ChannelClosed> {
        self.sender.send(message)
    }

    /// Tear down the transport pumps. In-memory pairs close when dropped.
    pub fn close(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

impl Drop for WireMessageChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::KernelInfoRequest;

    fn message() -> JupyterMessage {
        KernelInfoRequest::default().into()
    }

    #[tokio::test]
    async fn test_pair_delivers_both_directions() {
        let (mut a, mut b) = WireMessageChannel::pair();
        let sent = message();
        a.send(sent.clone()).unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got.header.msg_id, sent.header.msg_id);

        let back = message();
        b.send(back.clone()).unwrap();
        let got = a.recv().await.unwrap();
        assert_eq!(got.header.msg_id, back.header.msg_id);
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_peer_drops() {
        let (mut a, b) = WireMessageChannel::pair();
        drop(b);
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_peer_drop_returns_message() {
        let (a, b) = WireMessageChannel::pair();
        drop(b);
        let sent = message();
        let err = a.send(sent.clone()).unwrap_err();
        assert_eq!(err.0.header.msg_id, sent.header.msg_id);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let (a, mut b) = WireMessageChannel::pair();
        let first = message();
        let second = message();
        a.send(first.clone()).unwrap();
        a.send(second.clone()).unwrap();
        assert_eq!(b.recv().await.unwrap().header.msg_id, first.header.msg_id);
        assert_eq!(b.recv().await.unwrap().header.msg_id, second.header.msg_id);
    }
}
