//! Acknowledgement handles and the pending-operation queue.
//!
//! User code gets an [`AckHandle`] per message. Deciding a handle removes
//! the message's lease (freeing flow-control capacity) and enqueues the
//! operation; the stream connection coalesces queued operations into
//! outgoing requests on a fixed cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::debug;

use super::lease::{Distribution, LeaseTable};
use crate::types::AckId;

/// Permanent reason an ack or nack was rejected by the service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    /// The ack id was malformed or its delivery attempt already expired.
    #[error("ack id is invalid or expired")]
    InvalidAckId,
    /// The operation arrived out of order for an ordered subscription.
    #[error("ack arrived out of order")]
    Unordered,
    /// The caller lacks permission on the subscription.
    #[error("permission denied")]
    PermissionDenied,
    /// The subscription state rejects the operation.
    #[error("failed precondition")]
    FailedPrecondition,
    /// Any other terminal failure.
    #[error("ack failed: {0}")]
    Other(String),
}

/// Terminal outcome of an ack or nack under exactly-once delivery.
///
/// A permanent failure means the message's fate must be verified
/// independently; the service may redeliver it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The service confirmed the operation.
    Success,
    /// The service rejected the operation and will not accept a retry.
    PermanentFailure(AckError),
}

/// A write-once cell resolved with the outcome of one ack/nack.
///
/// Any number of waiters may observe the outcome; only the first resolve
/// takes effect.
pub struct OutcomeSlot {
    tx: watch::Sender<Option<AckOutcome>>,
}

impl OutcomeSlot {
    /// Create an unresolved slot.
    pub fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(None);
        Arc::new(Self { tx })
    }

    /// Resolve the slot. Returns false if it was already resolved.
    pub fn resolve(&self, outcome: AckOutcome) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(outcome.clone());
                true
            }
        })
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> AckOutcome {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without resolving; the stream is gone.
                return AckOutcome::PermanentFailure(AckError::Other(
                    "subscriber stopped before the outcome was confirmed".to_string(),
                ));
            }
        }
    }

    /// Whether the slot has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// One queued ack or nack.
pub(crate) struct AckEntry {
    /// Ack token the operation targets.
    pub ack_id: String,
    /// Outcome slot, present under exactly-once delivery.
    pub slot: Option<Arc<OutcomeSlot>>,
}

/// A queued deadline extension for a group of leases.
pub(crate) struct Extension {
    /// Renewed deadline in seconds.
    pub seconds: u32,
    /// Leases to extend.
    pub ack_ids: Vec<String>,
}

#[derive(Default)]
pub(crate) struct QueueInner {
    pub acks: Vec<AckEntry>,
    pub nacks: Vec<AckEntry>,
    pub receipts: Vec<String>,
    pub extensions: Vec<Extension>,
}

impl QueueInner {
    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
            && self.nacks.is_empty()
            && self.receipts.is_empty()
            && self.extensions.is_empty()
    }
}

/// Pending ack/nack/extension operations, coalesced before each flush.
#[derive(Default)]
pub(crate) struct AckQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl AckQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ack(&self, entry: AckEntry) {
        self.inner.lock().unwrap().acks.push(entry);
        self.notify.notify_one();
    }

    pub fn push_nack(&self, entry: AckEntry) {
        self.inner.lock().unwrap().nacks.push(entry);
        self.notify.notify_one();
    }

    pub fn push_receipt(&self, ack_id: String) {
        self.inner.lock().unwrap().receipts.push(ack_id);
        self.notify.notify_one();
    }

    pub fn push_extension(&self, extension: Extension) {
        if extension.ack_ids.is_empty() {
            return;
        }
        self.inner.lock().unwrap().extensions.push(extension);
        self.notify.notify_one();
    }

    /// Re-queue acks whose confirmation reported a transient failure.
    pub fn requeue_acks(&self, entries: Vec<AckEntry>) {
        if entries.is_empty() {
            return;
        }
        self.inner.lock().unwrap().acks.extend(entries);
        self.notify.notify_one();
    }

    /// Re-queue nacks whose confirmation reported a transient failure.
    pub fn requeue_nacks(&self, entries: Vec<AckEntry>) {
        if entries.is_empty() {
            return;
        }
        self.inner.lock().unwrap().nacks.extend(entries);
        self.notify.notify_one();
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> QueueInner {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Wait until something is queued.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// The capability returned to user code to acknowledge or negatively
/// acknowledge one message.
///
/// `ack` and `nack` are idempotent: the first decision wins and later
/// calls are no-ops. Under exactly-once delivery the handle additionally
/// carries a resolvable outcome; use [`AckHandle::ack_with_outcome`] /
/// [`AckHandle::nack_with_outcome`] to observe it.
#[derive(Clone)]
pub struct AckHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    ack_id: AckId,
    decided: AtomicBool,
    queue: Arc<AckQueue>,
    leases: Arc<LeaseTable>,
    latency: Arc<Distribution>,
    received_at: Instant,
    slot: Option<Arc<OutcomeSlot>>,
}

enum Decision {
    Ack,
    Nack,
}

impl AckHandle {
    pub(crate) fn new(
        ack_id: AckId,
        queue: Arc<AckQueue>,
        leases: Arc<LeaseTable>,
        latency: Arc<Distribution>,
        slot: Option<Arc<OutcomeSlot>>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                ack_id,
                decided: AtomicBool::new(false),
                queue,
                leases,
                latency,
                received_at: Instant::now(),
                slot,
            }),
        }
    }

    /// Ack token of the delivery this handle controls.
    pub fn ack_id(&self) -> &AckId {
        &self.inner.ack_id
    }

    /// Whether this handle exposes a confirmed outcome (exactly-once).
    pub fn has_outcome(&self) -> bool {
        self.inner.slot.is_some()
    }

    /// Acknowledge the message. The lease is released as soon as the
    /// request is queued; at-least-once subscriptions get no feedback.
    pub fn ack(&self) {
        self.decide(Decision::Ack);
    }

    /// Make the message immediately eligible for redelivery.
    pub fn nack(&self) {
        self.decide(Decision::Nack);
    }

    /// Acknowledge and wait for the service-confirmed outcome.
    ///
    /// Without exactly-once delivery this resolves `Success` as soon as
    /// the ack is queued.
    pub async fn ack_with_outcome(&self) -> AckOutcome {
        self.decide(Decision::Ack);
        self.wait_outcome().await
    }

    /// Negatively acknowledge and wait for the service-confirmed outcome.
    pub async fn nack_with_outcome(&self) -> AckOutcome {
        self.decide(Decision::Nack);
        self.wait_outcome().await
    }

    async fn wait_outcome(&self) -> AckOutcome {
        match &self.inner.slot {
            Some(slot) => slot.wait().await,
            None => AckOutcome::Success,
        }
    }

    fn decide(&self, decision: Decision) {
        if self.inner.decided.swap(true, Ordering::SeqCst) {
            // Second decision on the same handle is a no-op.
            return;
        }
        let ack_id = self.inner.ack_id.as_str();
        self.inner.leases.forget(ack_id);
        let entry = AckEntry {
            ack_id: ack_id.to_string(),
            slot: self.inner.slot.clone(),
        };
        match decision {
            Decision::Ack => {
                let elapsed = self.inner.received_at.elapsed();
                self.inner.latency.record(elapsed.as_secs_f64().ceil() as u64);
                debug!(ack_id = %self.inner.ack_id, "ack queued");
                self.inner.queue.push_ack(entry);
            }
            Decision::Nack => {
                debug!(ack_id = %self.inner.ack_id, "nack queued");
                self.inner.queue.push_nack(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseConfig;
    use crate::subscriber::flow::FlowController;
    use std::time::Duration;

    fn handle_fixture(slot: Option<Arc<OutcomeSlot>>) -> (AckHandle, Arc<AckQueue>, Arc<LeaseTable>) {
        let queue = AckQueue::new();
        let leases = LeaseTable::new(&LeaseConfig::default());
        let latency = Arc::new(Distribution::new());
        let handle = AckHandle::new(
            AckId("a-1".to_string()),
            queue.clone(),
            leases.clone(),
            latency,
            slot,
        );
        (handle, queue, leases)
    }

    async fn insert_lease(leases: &Arc<LeaseTable>, ack_id: &str) {
        let flow = FlowController::new(&crate::config::FlowControlConfig::default());
        let permit = flow.admit(10).await;
        assert!(leases.insert(
            ack_id.to_string(),
            permit,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
    }

    #[tokio::test]
    async fn test_ack_queues_once() {
        let (handle, queue, leases) = handle_fixture(None);
        insert_lease(&leases, "a-1").await;

        handle.ack();
        handle.ack();
        handle.nack();

        let drained = queue.drain();
        assert_eq!(drained.acks.len(), 1);
        assert!(drained.nacks.is_empty());
        assert_eq!(leases.len(), 0);
    }

    #[tokio::test]
    async fn test_nack_queues_once() {
        let (handle, queue, leases) = handle_fixture(None);
        insert_lease(&leases, "a-1").await;

        handle.nack();
        handle.nack();
        handle.ack();

        let drained = queue.drain();
        assert_eq!(drained.nacks.len(), 1);
        assert!(drained.acks.is_empty());
    }

    #[tokio::test]
    async fn test_outcome_without_exactly_once_is_success() {
        let (handle, _queue, leases) = handle_fixture(None);
        insert_lease(&leases, "a-1").await;
        assert!(!handle.has_outcome());
        assert_eq!(handle.ack_with_outcome().await, AckOutcome::Success);
    }

    #[tokio::test]
    async fn test_outcome_slot_resolves_exactly_once() {
        let slot = OutcomeSlot::new();
        assert!(slot.resolve(AckOutcome::Success));
        assert!(!slot.resolve(AckOutcome::PermanentFailure(AckError::InvalidAckId)));
        assert_eq!(slot.wait().await, AckOutcome::Success);
    }

    #[tokio::test]
    async fn test_outcome_waits_for_confirmation() {
        let slot = OutcomeSlot::new();
        let (handle, _queue, leases) = handle_fixture(Some(slot.clone()));
        insert_lease(&leases, "a-1").await;

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.ack_with_outcome().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        slot.resolve(AckOutcome::PermanentFailure(AckError::InvalidAckId));
        let outcome = waiter.await.unwrap();
        assert_eq!(
            outcome,
            AckOutcome::PermanentFailure(AckError::InvalidAckId)
        );
    }

    #[test]
    fn test_queue_drain_takes_everything() {
        let queue = AckQueue::new();
        queue.push_receipt("r-1".to_string());
        queue.push_extension(Extension {
            seconds: 60,
            ack_ids: vec!["e-1".to_string()],
        });
        queue.push_ack(AckEntry {
            ack_id: "a-1".to_string(),
            slot: None,
        });

        let drained = queue.drain();
        assert_eq!(drained.receipts.len(), 1);
        assert_eq!(drained.extensions.len(), 1);
        assert_eq!(drained.acks.len(), 1);
        assert!(queue.is_empty());
    }
}
