//! Client-side batching publisher.
//!
//! Messages accumulate into batches bounded by element count, byte size
//! and age; whichever threshold is hit first flushes the batch into a
//! publish RPC. With ordering enabled, each ordering key gets its own
//! batch and a strictly sequential send pipeline: a failed batch pauses
//! the key until [`Publisher::resume_publish`] is called.
//!
//! All batch state is owned by a single actor task fed by a command
//! channel, so no locks are held across sends.

mod batch;
mod sequencer;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{message_size, outgoing_to_proto, proto};
use crate::backoff::Backoff;
use crate::config::{PublisherConfig, MAX_REQUEST_BYTES};
use crate::error::{is_retryable, Error, Result};
use crate::transport::PubsubTransport;
use crate::types::OutgoingMessage;

use batch::{PendingBatch, SealedBatch};
use sequencer::KeySequencer;

/// Resolves to the server-assigned message id once the containing batch
/// has been published.
pub struct PublishReceipt {
    rx: oneshot::Receiver<Result<String>>,
}

impl PublishReceipt {
    fn ready(result: Result<String>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for PublishReceipt {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::PublisherShutdown),
        })
    }
}

enum Command {
    Publish {
        message: proto::PubsubMessage,
        size: usize,
        key: String,
        done: oneshot::Sender<Result<String>>,
    },
    Flush,
    Resume(String),
    BatchDone {
        key: String,
        failed: Option<FailedBatch>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// A batch that could not be published: the actor pauses its key (when
/// ordered) before resolving the completions, so a failed receipt always
/// implies the key is already paused.
struct FailedBatch {
    completions: Vec<batch::Completion>,
    status: Option<tonic::Status>,
}

fn failure_error(status: &Option<tonic::Status>) -> Error {
    match status {
        Some(status) => Error::Rpc(status.clone()),
        None => Error::Internal("publish response message id count mismatch".to_string()),
    }
}

/// A publisher bound to one topic.
pub struct Publisher {
    topic: String,
    enable_ordering: bool,
    cmd_tx: mpsc::UnboundedSender<Command>,
    shutdown: AtomicBool,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    /// Validate the configuration and start the batching actor.
    pub fn new(config: PublisherConfig, transport: Arc<dyn PubsubTransport>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        info!(topic = %config.topic, "starting publisher");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            transport,
            config: config.clone(),
            cmd_tx: cmd_tx.clone(),
            batches: HashMap::new(),
            sequencer: KeySequencer::default(),
            in_flight_unordered: 0,
            shutting_down: false,
            shutdown_done: Vec::new(),
        };
        let handle = tokio::spawn(actor.run(cmd_rx));

        Ok(Self {
            topic: config.topic.clone(),
            enable_ordering: config.enable_ordering,
            cmd_tx,
            shutdown: AtomicBool::new(false),
            actor: Mutex::new(Some(handle)),
        })
    }

    /// Topic this publisher publishes to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Schedule a message for publishing. The returned receipt resolves
    /// with the server-assigned message id once the batch containing the
    /// message completes, or with the failure that stopped it.
    pub fn publish(&self, message: OutgoingMessage) -> PublishReceipt {
        if self.shutdown.load(Ordering::SeqCst) {
            return PublishReceipt::ready(Err(Error::PublisherShutdown));
        }
        let key = message.ordering_key.clone().unwrap_or_default();
        if !key.is_empty() && !self.enable_ordering {
            return PublishReceipt::ready(Err(Error::OrderingNotEnabled));
        }

        let message = outgoing_to_proto(message);
        let size = message_size(&message);
        if size > MAX_REQUEST_BYTES {
            return PublishReceipt::ready(Err(Error::MessageTooLarge {
                size,
                max: MAX_REQUEST_BYTES,
            }));
        }

        let (done, rx) = oneshot::channel();
        let command = Command::Publish {
            message,
            size,
            key,
            done,
        };
        if self.cmd_tx.send(command).is_err() {
            return PublishReceipt::ready(Err(Error::PublisherShutdown));
        }
        PublishReceipt { rx }
    }

    /// Resume publishing for an ordering key paused by a failed batch.
    /// No-op if the key is not paused.
    pub fn resume_publish(&self, key: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Resume(key.into()));
    }

    /// Send all outstanding batches now without waiting for them to
    /// complete. Await the individual receipts for completion.
    pub fn flush(&self) {
        let _ = self.cmd_tx.send(Command::Flush);
    }

    /// Send remaining batches, wait for in-flight publishes to finish and
    /// stop the actor. Later publishes fail with
    /// [`Error::PublisherShutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Err(Error::PublisherShutdown);
        }
        let (done, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(done)).is_ok() {
            let _ = rx.await;
        }
        let handle = self.actor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(topic = %self.topic, "publisher stopped");
        Ok(())
    }
}

struct Actor {
    transport: Arc<dyn PubsubTransport>,
    config: Arc<PublisherConfig>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    batches: HashMap<String, PendingBatch>,
    sequencer: KeySequencer,
    in_flight_unordered: usize,
    shutting_down: bool,
    shutdown_done: Vec<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let command = match self.earliest_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        command = cmd_rx.recv() => match command {
                            Some(command) => Some(command),
                            None => break,
                        },
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => None,
                    }
                }
                None => match cmd_rx.recv().await {
                    Some(command) => Some(command),
                    None => break,
                },
            };

            match command {
                Some(command) => self.handle(command),
                None => self.flush_due(),
            }

            if self.shutting_down && self.is_idle() {
                for done in self.shutdown_done.drain(..) {
                    let _ = done.send(());
                }
                break;
            }
        }
        debug!("publisher actor stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Publish {
                message,
                size,
                key,
                done,
            } => self.on_publish(message, size, key, done),
            Command::Flush => self.flush_all(),
            Command::Resume(key) => {
                if self.sequencer.resume(&key) {
                    info!(key = %key, "resumed publishing for ordering key");
                }
            }
            Command::BatchDone { key, failed } => self.on_batch_done(key, failed),
            Command::Shutdown(done) => {
                self.shutting_down = true;
                self.shutdown_done.push(done);
                self.flush_all();
            }
        }
    }

    fn on_publish(
        &mut self,
        message: proto::PubsubMessage,
        size: usize,
        key: String,
        done: oneshot::Sender<Result<String>>,
    ) {
        if self.shutting_down {
            let _ = done.send(Err(Error::PublisherShutdown));
            return;
        }
        if !key.is_empty() && self.sequencer.is_paused(&key) {
            let _ = done.send(Err(Error::OrderingKeyPaused(key)));
            return;
        }

        let batch = self
            .batches
            .entry(key.clone())
            .or_insert_with(|| PendingBatch::new(key.clone()));
        if batch.would_overflow(size) {
            let full = std::mem::replace(batch, PendingBatch::new(key.clone()));
            self.dispatch(full.seal());
        }

        let batch = self
            .batches
            .get_mut(&key)
            .expect("batch exists after insert");
        batch.push(message, size, done);
        if batch.is_full(&self.config.batching) {
            let full = self.batches.remove(&key).expect("batch present");
            self.dispatch(full.seal());
        }
    }

    fn on_batch_done(&mut self, key: String, failed: Option<FailedBatch>) {
        if key.is_empty() {
            self.in_flight_unordered -= 1;
            if let Some(failed) = failed {
                for completion in failed.completions {
                    let _ = completion.send(Err(failure_error(&failed.status)));
                }
            }
            return;
        }

        match failed {
            None => {
                if let Some(next) = self.sequencer.complete(&key) {
                    self.spawn_send(next);
                }
            }
            Some(failed) => {
                // Failure aborts everything queued behind the batch for
                // this key until the caller explicitly resumes.
                warn!(key = %key, "publish failed; pausing ordering key");
                for queued in self.sequencer.fail(&key) {
                    for completion in queued.completions {
                        let _ = completion.send(Err(Error::OrderingKeyPaused(key.clone())));
                    }
                }
                if let Some(pending) = self.batches.remove(&key) {
                    pending.fail(|| Error::OrderingKeyPaused(key.clone()));
                }
                for completion in failed.completions {
                    let _ = completion.send(Err(failure_error(&failed.status)));
                }
            }
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.batches
            .values()
            .filter(|batch| !batch.is_empty())
            .map(|batch| batch.deadline(self.config.batching.max_delay))
            .min()
    }

    fn flush_due(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .batches
            .iter()
            .filter(|(_, batch)| {
                !batch.is_empty() && batch.deadline(self.config.batching.max_delay) <= now
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            let batch = self.batches.remove(&key).expect("due batch present");
            self.dispatch(batch.seal());
        }
    }

    fn flush_all(&mut self) {
        let keys: Vec<String> = self.batches.keys().cloned().collect();
        for key in keys {
            let batch = self.batches.remove(&key).expect("batch present");
            if !batch.is_empty() {
                self.dispatch(batch.seal());
            }
        }
    }

    fn dispatch(&mut self, batch: SealedBatch) {
        if batch.ordering_key.is_empty() {
            self.in_flight_unordered += 1;
            self.spawn_send(batch);
        } else if let Some(batch) = self.sequencer.submit(batch) {
            self.spawn_send(batch);
        }
    }

    fn spawn_send(&self, batch: SealedBatch) {
        let transport = self.transport.clone();
        let config = self.config.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let key = batch.ordering_key.clone();
            let failed = send_batch(transport, config, batch).await;
            let _ = cmd_tx.send(Command::BatchDone { key, failed });
        });
    }

    fn is_idle(&self) -> bool {
        self.batches.values().all(PendingBatch::is_empty)
            && self.sequencer.is_idle()
            && self.in_flight_unordered == 0
    }
}

/// Publish one sealed batch, retrying transient failures under the
/// configured backoff budget. Success resolves every message's receipt
/// here; failures hand the unresolved completions back to the actor so
/// pausing happens before receipts observe the error.
async fn send_batch(
    transport: Arc<dyn PubsubTransport>,
    config: Arc<PublisherConfig>,
    batch: SealedBatch,
) -> Option<FailedBatch> {
    let compress = config.compression.enabled && batch.bytes >= config.compression.min_bytes;
    let expected = batch.len();
    let request = proto::PublishRequest {
        topic: config.topic.clone(),
        messages: batch.messages,
    };
    let completions = batch.completions;

    let mut backoff = Backoff::new(&config.retry);
    loop {
        match transport.publish(request.clone(), compress).await {
            Ok(response) => {
                if response.message_ids.len() != expected {
                    warn!(
                        got = response.message_ids.len(),
                        expected, "publish response id count mismatch"
                    );
                    return Some(FailedBatch {
                        completions,
                        status: None,
                    });
                }
                debug!(count = expected, compressed = compress, "batch published");
                for (completion, id) in completions.into_iter().zip(response.message_ids) {
                    let _ = completion.send(Ok(id));
                }
                return None;
            }
            Err(status) => {
                if is_retryable(&status) {
                    if let Some(delay) = backoff.next_delay() {
                        debug!(
                            code = ?status.code(),
                            delay_ms = delay.as_millis() as u64,
                            "publish failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
                warn!(code = ?status.code(), "publish failed permanently");
                return Some(FailedBatch {
                    completions,
                    status: Some(status),
                });
            }
        }
    }
}
