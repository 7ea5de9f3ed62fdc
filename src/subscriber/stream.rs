//! The streaming-pull connection.
//!
//! Owns the bidirectional stream to the service: sends the initial request
//! with subscription, deadline and flow limits, forwards inbound message
//! batches to the dispatcher, and writes coalesced ack/nack/extension
//! batches outbound on a fixed cadence. Transient stream failures
//! reconnect with jittered exponential backoff; permanent failures are
//! surfaced to the error listener and end the connection.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use super::ack::{AckEntry, AckError, AckOutcome, AckQueue, OutcomeSlot, QueueInner};
use super::dispatch::MessageDispatcher;
use super::lease::LeaseTable;
use crate::api::proto;
use crate::api::received_from_proto;
use crate::backoff::Backoff;
use crate::config::SubscriberConfig;
use crate::error::{is_retryable, Error};
use crate::transport::PubsubTransport;

/// Most ack/modack ids carried by one outgoing request.
const MAX_PER_REQUEST_CHANGES: usize = 1000;

/// Minimum per-extension deadline once exactly-once delivery is observed,
/// giving confirmations time to round-trip.
const EXACTLY_ONCE_MIN_EXTENSION_SECS: u32 = 60;

/// Observable lifecycle of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening the stream for the first time.
    Connecting,
    /// Stream is up and traffic is flowing.
    Streaming,
    /// Stream dropped on a transient error; backing off before retrying.
    Reconnecting,
    /// Draining final operations before teardown.
    Closing,
    /// Fully stopped.
    Closed,
}

/// Unconfirmed exactly-once operations, keyed by ack id, waiting for the
/// stream's confirmation fields.
#[derive(Default)]
struct PendingOutcomes {
    acks: HashMap<String, Option<Arc<OutcomeSlot>>>,
    nacks: HashMap<String, Option<Arc<OutcomeSlot>>>,
}

impl PendingOutcomes {
    fn is_empty(&self) -> bool {
        self.acks.is_empty() && self.nacks.is_empty()
    }
}

pub(crate) struct StreamingPullConnection {
    pub transport: Arc<dyn PubsubTransport>,
    pub config: Arc<SubscriberConfig>,
    pub queue: Arc<AckQueue>,
    pub leases: Arc<LeaseTable>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub exactly_once: Arc<AtomicBool>,
    pub ordered: Arc<AtomicBool>,
    /// Stable across reconnects so the service carries over guarantees
    /// made to the previous stream.
    pub client_id: String,
    pub state_tx: watch::Sender<ConnectionState>,
    pub errors: mpsc::UnboundedSender<Error>,
    pub shutdown: watch::Receiver<bool>,
}

impl StreamingPullConnection {
    /// Run the connection until shutdown or a permanent error.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(&self.config.retry);
        let mut pending = PendingOutcomes::default();
        let mut first_attempt = true;

        'outer: loop {
            if *self.shutdown.borrow() {
                break;
            }
            let _ = self.state_tx.send(if first_attempt {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });
            first_attempt = false;

            let (req_tx, req_rx) = mpsc::channel::<proto::StreamingPullRequest>(16);
            if req_tx.send(self.initial_request()).await.is_err() {
                break;
            }

            let mut responses = match self
                .transport
                .streaming_pull(ReceiverStream::new(req_rx))
                .await
            {
                Ok(stream) => stream,
                Err(status) => {
                    if !is_retryable(&status) {
                        error!(code = ?status.code(), "streaming pull failed permanently");
                        let _ = self.errors.send(Error::Rpc(status));
                        break 'outer;
                    }
                    match backoff.next_delay() {
                        Some(delay) => {
                            debug!(delay_ms = delay.as_millis() as u64, "stream connect failed; backing off");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => continue 'outer,
                                _ = self.shutdown.changed() => break 'outer,
                            }
                        }
                        None => {
                            let _ = self.errors.send(Error::Rpc(status));
                            break 'outer;
                        }
                    }
                }
            };

            info!(subscription = %self.config.subscription, "streaming pull connected");
            let _ = self.state_tx.send(ConnectionState::Streaming);

            let mut flush = interval(self.config.lease.flush_interval);
            flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    response = responses.next() => match response {
                        Some(Ok(response)) => {
                            backoff.reset();
                            self.handle_response(response, &mut pending);
                        }
                        Some(Err(status)) => {
                            if !is_retryable(&status) {
                                error!(code = ?status.code(), "stream terminated permanently");
                                let _ = self.errors.send(Error::Rpc(status));
                                self.fail_pending(&mut pending);
                                break 'outer;
                            }
                            debug!(code = ?status.code(), "stream closed with retryable error");
                            break;
                        }
                        None => {
                            // Service hung up cleanly (e.g. rebalancing);
                            // reconnect and carry on. Leases stay valid.
                            debug!("stream closed by service");
                            break;
                        }
                    },
                    _ = flush.tick() => {
                        if self.flush(&req_tx, &mut pending).await.is_err() {
                            break;
                        }
                    }
                    _ = self.shutdown.changed() => {
                        if *self.shutdown.borrow() {
                            let _ = self.state_tx.send(ConnectionState::Closing);
                            // One final flush over the live stream.
                            let _ = self.flush(&req_tx, &mut pending).await;
                            break 'outer;
                        }
                    }
                }
            }

            // Reconnecting: unconfirmed exactly-once operations ride the
            // next stream.
            self.requeue_pending(&mut pending);
            if let Some(delay) = backoff.next_delay() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.changed() => {
                        if *self.shutdown.borrow() {
                            break 'outer;
                        }
                    }
                }
            } else {
                let _ = self.errors.send(Error::Internal(
                    "stream reconnect budget exhausted".to_string(),
                ));
                break 'outer;
            }
        }

        let _ = self.state_tx.send(ConnectionState::Closing);
        self.final_flush().await;
        self.fail_pending(&mut pending);
        let _ = self.state_tx.send(ConnectionState::Closed);
        info!(subscription = %self.config.subscription, "streaming pull closed");
    }

    fn initial_request(&self) -> proto::StreamingPullRequest {
        proto::StreamingPullRequest {
            subscription: self.config.subscription.clone(),
            stream_ack_deadline_seconds: self.config.stream_ack_deadline.as_secs() as i32,
            client_id: self.client_id.clone(),
            max_outstanding_messages: self
                .config
                .flow_control
                .max_outstanding_messages
                .unwrap_or(0) as i64,
            max_outstanding_bytes: self.config.flow_control.max_outstanding_bytes.unwrap_or(0)
                as i64,
            ..Default::default()
        }
    }

    fn handle_response(
        &self,
        response: proto::StreamingPullResponse,
        pending: &mut PendingOutcomes,
    ) {
        if let Some(properties) = response.subscription_properties {
            self.apply_properties(&properties);
        }
        if let Some(confirmation) = response.acknowledge_confirmation {
            self.on_ack_confirmation(confirmation, pending);
        }
        if let Some(confirmation) = response.modify_ack_deadline_confirmation {
            self.on_modack_confirmation(confirmation, pending);
        }
        if !response.received_messages.is_empty() {
            let batch: Vec<_> = response
                .received_messages
                .into_iter()
                .filter_map(received_from_proto)
                .collect();
            debug!(count = batch.len(), "received message batch");
            self.dispatcher.feed(batch);
        }
    }

    fn apply_properties(
        &self,
        properties: &proto::streaming_pull_response::SubscriptionProperties,
    ) {
        let was_exactly_once = self
            .exactly_once
            .swap(properties.exactly_once_delivery_enabled, Ordering::SeqCst);
        if properties.exactly_once_delivery_enabled && !was_exactly_once {
            info!("exactly-once delivery enabled by subscription properties");
            self.leases
                .set_min_extension_secs(EXACTLY_ONCE_MIN_EXTENSION_SECS);
        }
        let ordered = self.config.ordered_delivery || properties.message_ordering_enabled;
        self.ordered.store(ordered, Ordering::SeqCst);
    }

    fn on_ack_confirmation(
        &self,
        confirmation: proto::streaming_pull_response::AcknowledgeConfirmation,
        pending: &mut PendingOutcomes,
    ) {
        for ack_id in &confirmation.ack_ids {
            if let Some(Some(slot)) = pending.acks.remove(ack_id) {
                slot.resolve(AckOutcome::Success);
            }
        }
        for ack_id in &confirmation.invalid_ack_ids {
            if let Some(Some(slot)) = pending.acks.remove(ack_id) {
                warn!(ack_id = %ack_id, "ack rejected: invalid ack id");
                slot.resolve(AckOutcome::PermanentFailure(AckError::InvalidAckId));
            }
        }
        for ack_id in &confirmation.unordered_ack_ids {
            if let Some(Some(slot)) = pending.acks.remove(ack_id) {
                warn!(ack_id = %ack_id, "ack rejected: out of order");
                slot.resolve(AckOutcome::PermanentFailure(AckError::Unordered));
            }
        }
        let retry: Vec<AckEntry> = confirmation
            .temporary_failed_ack_ids
            .iter()
            .filter_map(|ack_id| {
                pending.acks.remove(ack_id).map(|slot| AckEntry {
                    ack_id: ack_id.clone(),
                    slot,
                })
            })
            .collect();
        if !retry.is_empty() {
            debug!(count = retry.len(), "retrying temporarily failed acks");
            self.queue.requeue_acks(retry);
        }
    }

    fn on_modack_confirmation(
        &self,
        confirmation: proto::streaming_pull_response::ModifyAckDeadlineConfirmation,
        pending: &mut PendingOutcomes,
    ) {
        let mut confirmed_receipts = Vec::new();
        for ack_id in &confirmation.ack_ids {
            if let Some(Some(slot)) = pending.nacks.remove(ack_id) {
                slot.resolve(AckOutcome::Success);
            } else if self.dispatcher.gated(ack_id) {
                confirmed_receipts.push(ack_id.clone());
            }
        }
        if !confirmed_receipts.is_empty() {
            self.dispatcher.confirm_receipts(&confirmed_receipts);
        }

        let mut failed_receipts = Vec::new();
        for ack_id in &confirmation.invalid_ack_ids {
            if let Some(Some(slot)) = pending.nacks.remove(ack_id) {
                warn!(ack_id = %ack_id, "nack rejected: invalid ack id");
                slot.resolve(AckOutcome::PermanentFailure(AckError::InvalidAckId));
            } else if self.dispatcher.gated(ack_id) {
                failed_receipts.push(ack_id.clone());
            }
        }
        if !failed_receipts.is_empty() {
            self.dispatcher.fail_receipts(&failed_receipts);
        }

        let mut retry_nacks = Vec::new();
        for ack_id in &confirmation.temporary_failed_ack_ids {
            if let Some(slot) = pending.nacks.remove(ack_id) {
                retry_nacks.push(AckEntry {
                    ack_id: ack_id.clone(),
                    slot,
                });
            } else if self.dispatcher.gated(ack_id) {
                self.queue.push_receipt(ack_id.clone());
            }
        }
        if !retry_nacks.is_empty() {
            self.queue.requeue_nacks(retry_nacks);
        }
    }

    /// Drain queued operations and write them to the stream, coalesced
    /// into as few requests as chunking allows.
    async fn flush(
        &self,
        req_tx: &mpsc::Sender<proto::StreamingPullRequest>,
        pending: &mut PendingOutcomes,
    ) -> Result<(), ()> {
        let drained = self.queue.drain();
        if drained.is_empty() {
            return Ok(());
        }
        let track_outcomes = self.exactly_once.load(Ordering::SeqCst);

        let mut ack_ids = Vec::with_capacity(drained.acks.len());
        for entry in drained.acks {
            if track_outcomes {
                pending.acks.insert(entry.ack_id.clone(), entry.slot);
            }
            ack_ids.push(entry.ack_id);
        }

        // Nacks are deadline modifications to zero; receipts and renewals
        // carry the current deadline.
        let mut modify: Vec<(String, i32)> = Vec::new();
        for entry in drained.nacks {
            if track_outcomes {
                pending.nacks.insert(entry.ack_id.clone(), entry.slot);
            }
            modify.push((entry.ack_id, 0));
        }
        let receipt_deadline = self.leases.deadline_secs() as i32;
        for ack_id in drained.receipts {
            modify.push((ack_id, receipt_deadline));
        }
        for extension in drained.extensions {
            for ack_id in extension.ack_ids {
                modify.push((ack_id, extension.seconds as i32));
            }
        }

        let total_acks = ack_ids.len();
        let total_modacks = modify.len();
        let mut requests = Vec::new();
        while !ack_ids.is_empty() || !modify.is_empty() {
            let take_acks: Vec<String> = ack_ids
                .drain(..ack_ids.len().min(MAX_PER_REQUEST_CHANGES))
                .collect();
            let take_modify: Vec<(String, i32)> = modify
                .drain(..modify.len().min(MAX_PER_REQUEST_CHANGES))
                .collect();
            let (modify_deadline_ack_ids, modify_deadline_seconds): (Vec<String>, Vec<i32>) =
                take_modify.into_iter().unzip();
            requests.push(proto::StreamingPullRequest {
                ack_ids: take_acks,
                modify_deadline_ack_ids,
                modify_deadline_seconds,
                ..Default::default()
            });
        }

        debug!(acks = total_acks, modacks = total_modacks, "flushing ack operations");
        for request in requests {
            if req_tx.send(request).await.is_err() {
                debug!("stream writer closed during flush");
                return Err(());
            }
        }
        Ok(())
    }

    /// Push unconfirmed exactly-once operations back onto the queue so the
    /// replacement stream retries them. Gated deliveries get their receipt
    /// modacks re-issued too; any confirmation lost with the old stream
    /// would otherwise leave them parked forever.
    fn requeue_pending(&self, pending: &mut PendingOutcomes) {
        self.dispatcher.reissue_gated_receipts();
        if pending.is_empty() {
            return;
        }
        debug!(
            acks = pending.acks.len(),
            nacks = pending.nacks.len(),
            "requeueing unconfirmed operations for new stream"
        );
        let acks = pending
            .acks
            .drain()
            .map(|(ack_id, slot)| AckEntry { ack_id, slot })
            .collect();
        self.queue.requeue_acks(acks);
        let nacks = pending
            .nacks
            .drain()
            .map(|(ack_id, slot)| AckEntry { ack_id, slot })
            .collect();
        self.queue.requeue_nacks(nacks);
    }

    /// Last-chance delivery of queued operations over the unary RPCs once
    /// the stream is gone.
    async fn final_flush(&self) {
        let drained = self.queue.drain();
        if drained.is_empty() {
            return;
        }
        self.send_final(drained).await;
    }

    async fn send_final(&self, drained: QueueInner) {
        let subscription = self.config.subscription.clone();

        if !drained.acks.is_empty() {
            let ack_ids: Vec<String> = drained.acks.iter().map(|e| e.ack_id.clone()).collect();
            for chunk in ack_ids.chunks(MAX_PER_REQUEST_CHANGES) {
                let result = self
                    .transport
                    .acknowledge(proto::AcknowledgeRequest {
                        subscription: subscription.clone(),
                        ack_ids: chunk.to_vec(),
                    })
                    .await;
                if let Err(status) = &result {
                    warn!(code = ?status.code(), "final acknowledge failed");
                }
                for entry in &drained.acks {
                    if let Some(slot) = &entry.slot {
                        slot.resolve(outcome_from_unary(&result));
                    }
                }
            }
        }

        let mut nack_ids: Vec<String> = drained.nacks.iter().map(|e| e.ack_id.clone()).collect();
        // Receipts at teardown are pointless; drop them. Extensions are
        // folded into nothing: the leases are being given up anyway.
        if !nack_ids.is_empty() {
            nack_ids.dedup();
            for chunk in nack_ids.chunks(MAX_PER_REQUEST_CHANGES) {
                let result = self
                    .transport
                    .modify_ack_deadline(proto::ModifyAckDeadlineRequest {
                        subscription: subscription.clone(),
                        ack_deadline_seconds: 0,
                        ack_ids: chunk.to_vec(),
                    })
                    .await;
                if let Err(status) = &result {
                    warn!(code = ?status.code(), "final nack failed");
                }
                for entry in &drained.nacks {
                    if let Some(slot) = &entry.slot {
                        slot.resolve(outcome_from_unary(&result));
                    }
                }
            }
        }
    }

    /// Resolve whatever is still unconfirmed: the subscriber is going
    /// away, so callers must not be left waiting forever.
    fn fail_pending(&self, pending: &mut PendingOutcomes) {
        for (_, slot) in pending.acks.drain().chain(pending.nacks.drain()) {
            if let Some(slot) = slot {
                slot.resolve(AckOutcome::PermanentFailure(AckError::Other(
                    "subscriber stopped before the outcome was confirmed".to_string(),
                )));
            }
        }
    }
}

fn outcome_from_unary(result: &Result<(), tonic::Status>) -> AckOutcome {
    match result {
        Ok(()) => AckOutcome::Success,
        Err(status) => AckOutcome::PermanentFailure(match status.code() {
            tonic::Code::PermissionDenied => AckError::PermissionDenied,
            tonic::Code::FailedPrecondition => AckError::FailedPrecondition,
            _ => AckError::Other(status.message().to_string()),
        }),
    }
}
