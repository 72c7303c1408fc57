//! Bridge between sync FUSE callbacks and the tokio runtime.
//!
//! Kernel callbacks run on the fuser session thread. Work that needs the
//! runtime is either queued to a per-handle worker (reads) or, when the
//! callback must wait for the answer, run through [`execute`], which spawns
//! the future and blocks the calling thread on a oneshot channel with a
//! deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Counters for operations handed to the runtime.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub operations_started: AtomicU64,
    pub operations_completed: AtomicU64,
    pub operations_failed: AtomicU64,
    pub operations_timed_out: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl BridgeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_start(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_complete(&self) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.operations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.operations_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            started: self.operations_started.load(Ordering::Relaxed),
            completed: self.operations_completed.load(Ordering::Relaxed),
            failed: self.operations_failed.load(Ordering::Relaxed),
            timed_out: self.operations_timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Error from bridged operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation was cancelled")]
    Cancelled,
}

/// Runs `future` on `handle` and blocks the calling thread until it
/// finishes or `timeout` elapses.
///
/// Must not be called from a runtime worker thread. On timeout the spawned
/// task is aborted so it cannot keep holding resources.
pub fn execute<F, T>(
    handle: &Handle,
    timeout: Duration,
    future: F,
) -> Result<T, BridgeError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let task = handle.spawn(async move {
        let result = tokio::time::timeout(timeout, future).await;
        // Receiver may already be gone
        let _ = tx.send(result);
    });

    match rx.blocking_recv() {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_elapsed)) => {
            task.abort();
            Err(BridgeError::Timeout(timeout))
        }
        Err(_closed) => {
            task.abort();
            Err(BridgeError::Cancelled)
        }
    }
}
