//! Wire-level plumbing for talking to Jupyter kernels.
//!
//! This crate covers the layer between raw kernel channels and session
//! code: duplex message channels ([`WireMessageChannel`]), the connection
//! proxy that correlates requests with replies and fans out iopub traffic
//! ([`KernelConnectionProxy`]), socket identities for reconnect detection,
//! and the signal primitives everything above is wired together with.

pub mod channel;
pub mod proxy;
pub mod signal;
pub mod socket;
pub mod status;

pub use channel::{ChannelClosed, WireMessageChannel, WireReceiver, WireSender};
pub use proxy::{
    AnyMessage, KernelConnectionProxy, KernelInfo, KernelLifecycle, KernelModel, MessageDirection,
    RouteGuard, ShellRequest, ZmqControlLifecycle,
};
pub use signal::{CancellationToken, Signal, SignalBridge};
pub use socket::{KernelSocket, KernelSocketRegistry};
pub use status::{ConnectionStatus, KernelStatus};
