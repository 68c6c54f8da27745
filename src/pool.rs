//! Bounds the number of concurrently active sessions per server and lets a
//! shutdown wait for in-flight sessions to drain. `remails-com-remails`
//! shapes graceful shutdown the same way: a semaphore caps live work, and a
//! `CancellationToken` plus `wait_idle` handle the drain.

use std::sync::Arc;

use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

/// A bounded pool of client slots for one listener.
pub struct ClientPool {
    semaphore: Arc<Semaphore>,
}

/// An acquired slot; the session is counted against `max_clients` until this
/// is dropped.
pub struct ClientSlot<'a> {
    _permit: SemaphorePermit<'a>,
}

impl ClientPool {
    pub fn new(max_clients: usize) -> ClientPool {
        ClientPool {
            semaphore: Arc::new(Semaphore::new(max_clients.max(1))),
        }
    }

    /// Number of currently occupied slots.
    pub fn active_count(&self, max_clients: usize) -> usize {
        max_clients.saturating_sub(self.semaphore.available_permits())
    }

    /// Waits for a free slot. Only returns `Err` if the pool has been
    /// closed out from under an in-flight accept loop (during shutdown).
    pub async fn acquire(&self) -> Result<ClientSlot<'_>, AcquireError> {
        let permit = self.semaphore.acquire().await?;
        Ok(ClientSlot { _permit: permit })
    }

    /// Blocks until every outstanding slot has been released — used by a
    /// graceful shutdown to wait for active sessions to finish before
    /// tearing down the listener.
    pub async fn drain(&self, max_clients: usize) {
        if let Ok(permits) = self.semaphore.acquire_many(max_clients as u32).await {
            drop(permits);
        }
    }
}
