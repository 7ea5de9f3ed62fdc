//! Message dispatch: admission, handle construction and the worker pool
//! that runs receiver callbacks.

use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ack::{AckHandle, AckQueue, OutcomeSlot};
use super::flow::FlowController;
use super::lease::{Distribution, LeaseTable};
use super::MessageHandler;
use crate::error::Error;
use crate::types::ReceivedMessage;

/// One message on its way to the receiver.
struct DispatchItem {
    message: ReceivedMessage,
    handle: AckHandle,
    /// Ordering key this item is serialized under, decided once at
    /// submission so a runtime flip of the ordering flag cannot strand a
    /// key's queue.
    serial_key: Option<String>,
}

/// Multi-consumer FIFO work queue for the worker pool.
struct WorkQueue {
    inner: Mutex<WorkQueueInner>,
    notify: Notify,
}

struct WorkQueueInner {
    items: VecDeque<DispatchItem>,
    closed: bool,
}

impl WorkQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(WorkQueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    fn push(&self, item: DispatchItem) {
        self.inner.lock().unwrap().items.push_back(item);
        self.notify.notify_one();
    }

    /// Wait for the next item; None once the queue is closed and drained.
    async fn pop(&self) -> Option<DispatchItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

/// Per-ordering-key serialization: at most one receiver invocation in
/// flight per key, later messages queued in arrival order.
#[derive(Default)]
struct SerialQueues {
    inner: Mutex<HashMap<String, VecDeque<DispatchItem>>>,
}

impl SerialQueues {
    /// Returns the item if the key is idle (caller runs it now); otherwise
    /// queues it behind the in-flight one.
    fn submit(&self, key: &str, item: DispatchItem) -> Option<DispatchItem> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(key) {
            Some(pending) => {
                pending.push_back(item);
                None
            }
            None => {
                inner.insert(key.to_string(), VecDeque::new());
                Some(item)
            }
        }
    }

    /// Marks the in-flight invocation for `key` done and hands back the
    /// next queued item, if any.
    fn complete(&self, key: &str) -> Option<DispatchItem> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(key) {
            Some(pending) => match pending.pop_front() {
                Some(next) => Some(next),
                None => {
                    inner.remove(key);
                    None
                }
            },
            None => None,
        }
    }
}

/// Holds exactly-once deliveries until their receipt is confirmed,
/// releasing them in arrival order.
#[derive(Default)]
struct ReceiptGate {
    inner: Mutex<GateInner>,
}

#[derive(Default)]
struct GateInner {
    order: VecDeque<String>,
    pending: HashMap<String, (ReceivedMessage, bool)>,
}

impl ReceiptGate {
    fn defer(&self, message: ReceivedMessage) {
        let mut inner = self.inner.lock().unwrap();
        let ack_id = message.ack_id.0.clone();
        inner.order.push_back(ack_id.clone());
        inner.pending.insert(ack_id, (message, false));
    }

    /// Mark receipts confirmed and pop every leading message whose receipt
    /// has completed.
    fn confirm(&self, ack_ids: &[String]) -> Vec<ReceivedMessage> {
        let mut inner = self.inner.lock().unwrap();
        for ack_id in ack_ids {
            if let Some(entry) = inner.pending.get_mut(ack_id) {
                entry.1 = true;
            }
        }
        let mut ready = Vec::new();
        while let Some(front) = inner.order.front() {
            match inner.pending.get(front) {
                Some((_, true)) => {
                    let id = inner.order.pop_front().unwrap();
                    let (message, _) = inner.pending.remove(&id).unwrap();
                    ready.push(message);
                }
                Some((_, false)) => break,
                None => {
                    // Receipt failed earlier; skip the hole.
                    inner.order.pop_front();
                }
            }
        }
        ready
    }

    /// Drop deliveries whose receipt was rejected.
    fn fail(&self, ack_ids: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let mut dropped = Vec::new();
        for ack_id in ack_ids {
            if inner.pending.remove(ack_id).is_some() {
                dropped.push(ack_id.clone());
            }
        }
        dropped
    }

    /// Whether this ack id is parked waiting for its receipt.
    fn holds(&self, ack_id: &str) -> bool {
        self.inner.lock().unwrap().pending.contains_key(ack_id)
    }

    /// Ack ids currently parked, in arrival order.
    fn held_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter(|id| inner.pending.contains_key(*id))
            .cloned()
            .collect()
    }
}

/// Dispatches admitted messages to the receiver while constructing the
/// acknowledgement machinery around each one.
pub(crate) struct MessageDispatcher {
    handler: MessageHandler,
    queue: Arc<AckQueue>,
    leases: Arc<LeaseTable>,
    flow: Arc<FlowController>,
    latency: Arc<Distribution>,
    work: Arc<WorkQueue>,
    serial: Arc<SerialQueues>,
    gate: ReceiptGate,
    exactly_once: Arc<AtomicBool>,
    ordered: Arc<AtomicBool>,
    errors: mpsc::UnboundedSender<Error>,
    max_extension_period: Duration,
    accepting: AtomicBool,
    feed_tx: mpsc::UnboundedSender<Vec<ReceivedMessage>>,
    feed_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<ReceivedMessage>>>>,
}

impl MessageDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler: MessageHandler,
        queue: Arc<AckQueue>,
        leases: Arc<LeaseTable>,
        flow: Arc<FlowController>,
        latency: Arc<Distribution>,
        exactly_once: Arc<AtomicBool>,
        ordered: Arc<AtomicBool>,
        errors: mpsc::UnboundedSender<Error>,
        max_extension_period: Duration,
    ) -> Arc<Self> {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            handler,
            queue,
            leases,
            flow,
            latency,
            work: WorkQueue::new(),
            serial: Arc::new(SerialQueues::default()),
            gate: ReceiptGate::default(),
            exactly_once,
            ordered,
            errors,
            max_extension_period,
            accepting: AtomicBool::new(true),
            feed_tx,
            feed_rx: Mutex::new(Some(feed_rx)),
        })
    }

    /// Hand a batch from the stream to the dispatch path without blocking
    /// the stream reader; admission happens on the feed task.
    pub fn feed(&self, batch: Vec<ReceivedMessage>) {
        let _ = self.feed_tx.send(batch);
    }

    /// Start the feed task that admits batches past flow control.
    pub fn spawn_feed(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> JoinHandle<()> {
        let mut rx = self
            .feed_rx
            .lock()
            .unwrap()
            .take()
            .expect("feed task already started");
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    batch = rx.recv() => match batch {
                        Some(batch) => dispatcher.process_messages(batch).await,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("dispatch feed stopped");
        })
    }

    /// Start `count` worker tasks running receiver callbacks.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|id| {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    debug!(worker = id, "dispatch worker started");
                    while let Some(item) = dispatcher.work.pop().await {
                        dispatcher.run_item(item).await;
                    }
                    debug!(worker = id, "dispatch worker stopped");
                })
            })
            .collect()
    }

    /// Admit a batch from the stream: flow control, lease creation,
    /// receipt, then hand-off to the worker pool (or the receipt gate
    /// under exactly-once delivery).
    ///
    /// Suspends on flow control; the caller runs on the dispatch path, not
    /// the stream-read path.
    pub async fn process_messages(&self, messages: Vec<ReceivedMessage>) {
        for message in messages {
            if !self.accepting.load(Ordering::SeqCst) {
                // Stopping: admit nothing; the service redelivers.
                return;
            }
            let permit = self.flow.admit(message.size).await;
            let initial = Duration::from_secs(self.leases.deadline_secs() as u64);
            let ack_id = message.ack_id.0.clone();
            if !self
                .leases
                .insert(ack_id.clone(), permit, initial, self.max_extension_period)
            {
                debug!(ack_id = %ack_id, "dropping duplicate delivery");
                continue;
            }
            // Park exactly-once deliveries before queueing the receipt, so
            // a fast confirmation always finds the gate entry.
            if self.exactly_once.load(Ordering::SeqCst) {
                self.gate.defer(message);
                self.queue.push_receipt(ack_id);
            } else {
                self.queue.push_receipt(ack_id);
                self.submit(message);
            }
        }
    }

    /// Receipt confirmations arrived: release gated messages in order.
    pub fn confirm_receipts(&self, ack_ids: &[String]) {
        for message in self.gate.confirm(ack_ids) {
            self.submit(message);
        }
    }

    /// Receipt modacks permanently rejected: drop the gated deliveries and
    /// their leases.
    pub fn fail_receipts(&self, ack_ids: &[String]) {
        for ack_id in self.gate.fail(ack_ids) {
            warn!(ack_id = %ack_id, "receipt rejected; dropping delivery");
            self.leases.forget(&ack_id);
        }
    }

    /// Whether this ack id belongs to a delivery parked at the receipt
    /// gate.
    pub fn gated(&self, ack_id: &str) -> bool {
        self.gate.holds(ack_id)
    }

    /// Re-issue receipt modacks for every delivery still parked at the
    /// gate; used after a reconnect, when in-flight confirmations were
    /// lost with the stream.
    pub fn reissue_gated_receipts(&self) {
        for ack_id in self.gate.held_ids() {
            self.queue.push_receipt(ack_id);
        }
    }

    fn submit(&self, message: ReceivedMessage) {
        let slot = self
            .exactly_once
            .load(Ordering::SeqCst)
            .then(OutcomeSlot::new);
        let handle = AckHandle::new(
            message.ack_id.clone(),
            self.queue.clone(),
            self.leases.clone(),
            self.latency.clone(),
            slot,
        );
        let serial_key = message
            .ordering_key
            .clone()
            .filter(|_| self.ordered.load(Ordering::SeqCst));
        let item = DispatchItem {
            message,
            handle,
            serial_key,
        };

        match item.serial_key.clone() {
            Some(key) => {
                if let Some(item) = self.serial.submit(&key, item) {
                    self.work.push(item);
                }
            }
            None => self.work.push(item),
        }
    }

    async fn run_item(&self, item: DispatchItem) {
        let serial_key = item.serial_key.clone();

        self.deliver(item).await;

        if let Some(key) = serial_key {
            if let Some(next) = self.serial.complete(&key) {
                self.work.push(next);
            }
        }
    }

    async fn deliver(&self, item: DispatchItem) {
        let ack_id = item.message.ack_id.0.clone();
        if self.leases.is_expired(&ack_id) {
            // Expired while waiting for a worker. The service has likely
            // redelivered it elsewhere, so neither run it nor nack it.
            debug!(ack_id = %ack_id, "message expired before delivery");
            self.leases.forget(&ack_id);
            return;
        }

        let message_id = item.message.message_id.clone();
        let fut = (self.handler)(item.message, item.handle);
        if std::panic::AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .is_err()
        {
            // The lease stays in place: an implicitly unacked message is
            // redelivered once the engine stops extending it.
            warn!(message_id = %message_id, "receiver panicked");
            let _ = self.errors.send(Error::ReceiverPanic(message_id));
        }
    }

    /// Stop admitting new deliveries. In-flight receiver invocations are
    /// unaffected.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Close the worker queue; workers exit after draining it.
    pub fn close(&self) {
        self.work.close();
    }
}
