//! Socket identities and the process-wide socket registry.
//!
//! Each live transport attachment gets a [`KernelSocket`] with an id that
//! is unique for the lifetime of the process. Consumers compare socket
//! ids to tell "same connection" apart from "reconnected", so ids are
//! never reused even after a socket is removed from the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identity of one live kernel transport attachment.
#[derive(Debug)]
pub struct KernelSocket {
    id: u64,
    kernel_id: String,
}

impl KernelSocket {
    /// Process-unique id for this attachment.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the kernel this socket is attached to.
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }
}

/// Registry of live sockets, keyed by kernel id.
///
/// Registering a socket for a kernel that already has one replaces the
/// old entry; the old socket's id stays retired.
pub struct KernelSocketRegistry {
    next_id: AtomicU64,
    sockets: Mutex<HashMap<String, Arc<KernelSocket>>>,
}

impl KernelSocketRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sockets: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh socket for `kernel_id` and record it.
    pub fn register(&self, kernel_id: &str) -> Arc<KernelSocket> {
        let socket = Arc::new(KernelSocket {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kernel_id: kernel_id.to_string(),
        });
        let mut sockets = self.sockets.lock().unwrap();
        sockets.insert(kernel_id.to_string(), socket.clone());
        socket
    }

    pub fn get(&self, kernel_id: &str) -> Option<Arc<KernelSocket>> {
        let sockets = self.sockets.lock().unwrap();
        sockets.get(kernel_id).cloned()
    }

    pub fn remove(&self, kernel_id: &str) -> Option<Arc<KernelSocket>> {
        let mut sockets = self.sockets.lock().unwrap();
        sockets.remove(kernel_id)
    }
}

impl Default for KernelSocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
