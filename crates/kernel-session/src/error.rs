//! Error taxonomy for session connections and code execution.
//!
//! Errors are `Clone` because a single failure settles a watch-backed
//! outcome that many waiters may observe.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured kernel-side execution failure, carried out of an
/// `execute_reply` with `status = "error"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{ename}: {evalue}")]
pub struct KernelFailure {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The session or its kernel connection is gone. Not retryable.
    #[error("session has been disposed")]
    SessionDisposed,

    /// No kernel is attached where one is required.
    #[error("no kernel attached to session")]
    InvalidKernel,

    /// A wait was cancelled through its token. Callers must treat the
    /// session state as unknown afterwards.
    #[error("operation was cancelled")]
    Cancelled,

    /// The kernel did not reach idle within the allotted time.
    #[error("kernel did not become idle within {0:?}")]
    WaitForIdleTimeout(Duration),

    /// The kernel executed the code and reported an error.
    #[error(transparent)]
    Kernel(#[from] KernelFailure),

    /// Wire-level failure from the transport underneath.
    #[error("transport failure: {0}")]
    Transport(String),
}
