//! Client-side flow control for outstanding messages.
//!
//! Admission is limited on two dimensions, message count and total byte
//! size. Both semaphores queue waiters in FIFO order, so messages are
//! admitted in arrival order and a large message at the head of the line
//! is not starved by smaller ones behind it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::FlowControlConfig;

/// Tracks messages currently checked out to user code and admits new
/// deliveries against the configured maxima.
pub struct FlowController {
    messages: Option<Arc<Semaphore>>,
    bytes: Option<Arc<Semaphore>>,
    byte_limit: u64,
    totals: Arc<Totals>,
}

#[derive(Default)]
struct Totals {
    messages: AtomicU64,
    bytes: AtomicU64,
}

/// Capacity held by one admitted message. Dropping the permit releases it.
pub struct FlowPermit {
    _messages: Option<OwnedSemaphorePermit>,
    _bytes: Option<OwnedSemaphorePermit>,
    size: u64,
    totals: Arc<Totals>,
}

impl FlowController {
    /// Create a controller with the given limits.
    pub fn new(config: &FlowControlConfig) -> Self {
        let messages = config
            .max_outstanding_messages
            .map(|n| Arc::new(Semaphore::new(n.min(Semaphore::MAX_PERMITS as u64) as usize)));
        let byte_limit = config.max_outstanding_bytes.unwrap_or(u64::MAX);
        let bytes = config
            .max_outstanding_bytes
            .map(|n| Arc::new(Semaphore::new(n.min(Semaphore::MAX_PERMITS as u64) as usize)));
        Self {
            messages,
            bytes,
            byte_limit,
            totals: Arc::new(Totals::default()),
        }
    }

    /// Admit one message of `size` bytes, suspending until capacity is
    /// available on both dimensions.
    ///
    /// A message larger than the whole byte budget is clamped to the
    /// budget so it can still be admitted once the controller drains,
    /// instead of deadlocking.
    pub async fn admit(&self, size: usize) -> FlowPermit {
        let msg_permit = match &self.messages {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .expect("flow semaphore closed"),
            ),
            None => None,
        };
        let byte_permit = match &self.bytes {
            Some(sem) => {
                let want = (size as u64).min(self.byte_limit).min(u32::MAX as u64) as u32;
                Some(
                    sem.clone()
                        .acquire_many_owned(want)
                        .await
                        .expect("flow semaphore closed"),
                )
            }
            None => None,
        };
        self.totals.messages.fetch_add(1, Ordering::SeqCst);
        self.totals.bytes.fetch_add(size as u64, Ordering::SeqCst);
        FlowPermit {
            _messages: msg_permit,
            _bytes: byte_permit,
            size: size as u64,
            totals: self.totals.clone(),
        }
    }

    /// Current outstanding (message count, byte size).
    pub fn outstanding(&self) -> (u64, u64) {
        (
            self.totals.messages.load(Ordering::SeqCst),
            self.totals.bytes.load(Ordering::SeqCst),
        )
    }
}

impl Drop for FlowPermit {
    fn drop(&mut self) {
        self.totals.messages.fetch_sub(1, Ordering::SeqCst);
        self.totals.bytes.fetch_sub(self.size, Ordering::SeqCst);
    }
}
