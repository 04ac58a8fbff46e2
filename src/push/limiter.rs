//! Per-pushkin admission control.
//!
//! Each pushkin holds a counting semaphore sized to its
//! `inflight_request_limit`. Acquisition never blocks: when the pushkin is
//! saturated the dispatcher records a retryable outcome immediately — the
//! homeserver is the queue, not this process.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default maximum concurrent in-flight dispatches per pushkin.
pub const DEFAULT_INFLIGHT_LIMIT: usize = 100;

/// Fail-fast counting semaphore.
pub struct Limiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Limiter {
    /// Create a limiter with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Try to take one permit without waiting.
    #[must_use]
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Number of permits currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
