//! In-memory fake of the pub/sub service for integration tests.
//!
//! Implements the transport seam with real semantics: published messages
//! queue for delivery, delivered messages hold leases that expire and
//! redeliver with an incremented attempt counter, deadline-zero modacks
//! requeue immediately, and exactly-once mode reports confirmations.
//! Failure injection covers connect failures, publish failures and lease
//! behavior overrides.

// Each test binary uses a different slice of this fake.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use pubwire::api::proto;
use pubwire::transport::{PubsubTransport, ResponseStream};

/// One publish RPC as observed by the fake.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub message_count: usize,
    pub compressed: bool,
    pub ordering_keys: Vec<String>,
}

struct QueuedMessage {
    message: proto::PubsubMessage,
    attempts: u32,
}

struct LeasedMessage {
    queued: QueuedMessage,
    deadline: Instant,
}

#[derive(Default)]
struct ServiceState {
    queue: VecDeque<QueuedMessage>,
    leased: HashMap<String, LeasedMessage>,
    acked: Vec<String>,
    next_message_id: u64,
    stream_deadline: Duration,
    publish_records: Vec<PublishRecord>,
    publish_failures: VecDeque<Status>,
    connect_failures: VecDeque<Status>,
    reject_acks_as_invalid: usize,
    inflight_publishes: usize,
    max_concurrent_publishes: usize,
}

/// Shared fake service; clone handles freely.
#[derive(Clone)]
pub struct FakeService {
    state: Arc<Mutex<ServiceState>>,
    exactly_once: bool,
    honor_modacks: bool,
    deadline_override: Option<Duration>,
    publish_delay: Duration,
}

impl FakeService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServiceState {
                stream_deadline: Duration::from_secs(60),
                ..Default::default()
            })),
            exactly_once: false,
            honor_modacks: true,
            deadline_override: None,
            publish_delay: Duration::ZERO,
        }
    }

    /// Enable exactly-once delivery: confirmations are reported for every
    /// ack and deadline modification.
    pub fn with_exactly_once(mut self) -> Self {
        self.exactly_once = true;
        self
    }

    /// Ignore deadline extensions (but still honor deadline-zero nacks),
    /// simulating a service that lets leases run out.
    pub fn without_modacks(mut self) -> Self {
        self.honor_modacks = false;
        self
    }

    /// Lease deliveries for this long regardless of the stream deadline.
    pub fn with_lease_duration(mut self, deadline: Duration) -> Self {
        self.deadline_override = Some(deadline);
        self
    }

    /// Hold each publish RPC open for this long before completing it.
    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = delay;
        self
    }

    /// Script the next stream connect attempts to fail.
    pub fn fail_connects(&self, count: usize, status: impl Fn() -> Status) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.connect_failures.push_back(status());
        }
    }

    /// Script the next publish RPC to fail with the given status.
    pub fn fail_next_publish(&self, status: Status) {
        self.state.lock().unwrap().publish_failures.push_back(status);
    }

    /// Report the next `count` acked ids as invalid (exactly-once mode).
    pub fn reject_next_acks_as_invalid(&self, count: usize) {
        self.state.lock().unwrap().reject_acks_as_invalid = count;
    }

    /// Seed a message directly into the delivery queue.
    pub fn seed_message(&self, data: &[u8], ordering_key: Option<&str>) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_message_id += 1;
        let id = format!("m-{}", state.next_message_id);
        state.queue.push_back(QueuedMessage {
            message: proto::PubsubMessage {
                data: data.to_vec(),
                message_id: id.clone(),
                ordering_key: ordering_key.unwrap_or_default().to_string(),
                ..Default::default()
            },
            attempts: 0,
        });
        id
    }

    /// Message ids acknowledged so far.
    pub fn acked_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().acked.clone()
    }

    /// Publish RPCs observed so far.
    pub fn publish_records(&self) -> Vec<PublishRecord> {
        self.state.lock().unwrap().publish_records.clone()
    }

    /// Largest number of publish RPCs ever in flight at once.
    pub fn max_concurrent_publishes(&self) -> usize {
        self.state.lock().unwrap().max_concurrent_publishes
    }

    /// Messages waiting for delivery plus messages out on lease.
    pub fn undelivered(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.queue.len() + state.leased.len()
    }

    fn lease_duration(&self, state: &ServiceState) -> Duration {
        self.deadline_override.unwrap_or(state.stream_deadline)
    }

    fn handle_request(
        &self,
        request: proto::StreamingPullRequest,
    ) -> Option<proto::StreamingPullResponse> {
        let mut state = self.state.lock().unwrap();
        if !request.subscription.is_empty() && request.stream_ack_deadline_seconds > 0 {
            state.stream_deadline =
                Duration::from_secs(request.stream_ack_deadline_seconds as u64);
        }

        let mut ack_ok = Vec::new();
        let mut ack_invalid = Vec::new();
        for ack_id in request.ack_ids {
            if state.reject_acks_as_invalid > 0 {
                state.reject_acks_as_invalid -= 1;
                state.leased.remove(&ack_id);
                ack_invalid.push(ack_id);
                continue;
            }
            match state.leased.remove(&ack_id) {
                Some(lease) => {
                    state.acked.push(lease.queued.message.message_id.clone());
                    ack_ok.push(ack_id);
                }
                None => ack_invalid.push(ack_id),
            }
        }

        let mut mod_ok = Vec::new();
        let mut mod_invalid = Vec::new();
        let pairs = request
            .modify_deadline_ack_ids
            .into_iter()
            .zip(request.modify_deadline_seconds.into_iter());
        for (ack_id, seconds) in pairs {
            if seconds == 0 {
                match state.leased.remove(&ack_id) {
                    Some(lease) => {
                        state.queue.push_back(lease.queued);
                        mod_ok.push(ack_id);
                    }
                    None => mod_invalid.push(ack_id),
                }
            } else {
                let honor = self.honor_modacks;
                match state.leased.get_mut(&ack_id) {
                    Some(lease) => {
                        if honor {
                            lease.deadline =
                                Instant::now() + Duration::from_secs(seconds as u64);
                        }
                        mod_ok.push(ack_id);
                    }
                    None => mod_invalid.push(ack_id),
                }
            }
        }

        if !self.exactly_once {
            return None;
        }
        let nothing = ack_ok.is_empty()
            && ack_invalid.is_empty()
            && mod_ok.is_empty()
            && mod_invalid.is_empty();
        if nothing {
            return None;
        }
        Some(proto::StreamingPullResponse {
            acknowledge_confirmation: Some(
                proto::streaming_pull_response::AcknowledgeConfirmation {
                    ack_ids: ack_ok,
                    invalid_ack_ids: ack_invalid,
                    ..Default::default()
                },
            ),
            modify_ack_deadline_confirmation: Some(
                proto::streaming_pull_response::ModifyAckDeadlineConfirmation {
                    ack_ids: mod_ok,
                    invalid_ack_ids: mod_invalid,
                    ..Default::default()
                },
            ),
            ..Default::default()
        })
    }

    /// Expire overdue leases and lease out up to `limit` queued messages.
    fn take_deliverable(&self, limit: usize) -> Vec<proto::ReceivedMessage> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let expired: Vec<String> = state
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in expired {
            let lease = state.leased.remove(&ack_id).unwrap();
            state.queue.push_back(lease.queued);
        }

        let lease_for = self.lease_duration(&state);
        let mut out = Vec::new();
        while out.len() < limit {
            let Some(mut queued) = state.queue.pop_front() else {
                break;
            };
            queued.attempts += 1;
            let ack_id = format!(
                "ack-{}-{}",
                queued.message.message_id, queued.attempts
            );
            out.push(proto::ReceivedMessage {
                ack_id: ack_id.clone(),
                message: Some(queued.message.clone()),
                delivery_attempt: queued.attempts as i32,
            });
            state.leased.insert(
                ack_id,
                LeasedMessage {
                    queued,
                    deadline: now + lease_for,
                },
            );
        }
        out
    }
}

#[async_trait]
impl PubsubTransport for FakeService {
    async fn streaming_pull(
        &self,
        requests: ReceiverStream<proto::StreamingPullRequest>,
    ) -> Result<ResponseStream, Status> {
        if let Some(status) = self.state.lock().unwrap().connect_failures.pop_front() {
            return Err(status);
        }

        let (resp_tx, resp_rx) = mpsc::channel::<proto::StreamingPullResponse>(64);
        let (closed_tx, closed_rx) = watch::channel(false);

        // Request consumer: acks, nacks, deadline changes, confirmations.
        {
            let service = self.clone();
            let resp_tx = resp_tx.clone();
            tokio::spawn(async move {
                let mut requests = requests;
                while let Some(request) = requests.next().await {
                    if let Some(confirmation) = service.handle_request(request) {
                        if resp_tx.send(confirmation).await.is_err() {
                            break;
                        }
                    }
                }
                let _ = closed_tx.send(true);
            });
        }

        // Delivery pump: leases queued messages out to the stream.
        {
            let service = self.clone();
            let exactly_once = self.exactly_once;
            let mut closed_rx = closed_rx;
            tokio::spawn(async move {
                let properties = proto::StreamingPullResponse {
                    subscription_properties: Some(
                        proto::streaming_pull_response::SubscriptionProperties {
                            exactly_once_delivery_enabled: exactly_once,
                            message_ordering_enabled: false,
                        },
                    ),
                    ..Default::default()
                };
                if resp_tx.send(properties).await.is_err() {
                    return;
                }
                let mut tick = tokio::time::interval(Duration::from_millis(10));
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        _ = closed_rx.changed() => {
                            if *closed_rx.borrow() {
                                break;
                            }
                        }
                    }
                    let batch = service.take_deliverable(usize::MAX);
                    if batch.is_empty() {
                        continue;
                    }
                    let response = proto::StreamingPullResponse {
                        received_messages: batch,
                        ..Default::default()
                    };
                    if resp_tx.send(response).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(Box::pin(ReceiverStream::new(resp_rx).map(Ok)))
    }

    async fn publish(
        &self,
        request: proto::PublishRequest,
        compress: bool,
    ) -> Result<proto::PublishResponse, Status> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(status) = state.publish_failures.pop_front() {
                return Err(status);
            }
            state.inflight_publishes += 1;
            state.max_concurrent_publishes =
                state.max_concurrent_publishes.max(state.inflight_publishes);
        }
        if !self.publish_delay.is_zero() {
            tokio::time::sleep(self.publish_delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.inflight_publishes -= 1;
        state.publish_records.push(PublishRecord {
            message_count: request.messages.len(),
            compressed: compress,
            ordering_keys: request
                .messages
                .iter()
                .map(|m| m.ordering_key.clone())
                .collect(),
        });
        let mut message_ids = Vec::with_capacity(request.messages.len());
        for mut message in request.messages {
            state.next_message_id += 1;
            let id = format!("m-{}", state.next_message_id);
            message.message_id = id.clone();
            message_ids.push(id);
            state.queue.push_back(QueuedMessage {
                message,
                attempts: 0,
            });
        }
        Ok(proto::PublishResponse { message_ids })
    }

    async fn pull(
        &self,
        request: proto::PullRequest,
    ) -> Result<proto::PullResponse, Status> {
        let received = self.take_deliverable(request.max_messages.max(0) as usize);
        Ok(proto::PullResponse {
            received_messages: received,
        })
    }

    async fn acknowledge(
        &self,
        request: proto::AcknowledgeRequest,
    ) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        for ack_id in request.ack_ids {
            if let Some(lease) = state.leased.remove(&ack_id) {
                state.acked.push(lease.queued.message.message_id.clone());
            }
        }
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        request: proto::ModifyAckDeadlineRequest,
    ) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        for ack_id in request.ack_ids {
            if request.ack_deadline_seconds == 0 {
                if let Some(lease) = state.leased.remove(&ack_id) {
                    state.queue.push_back(lease.queued);
                }
            } else if let Some(lease) = state.leased.get_mut(&ack_id) {
                lease.deadline = Instant::now()
                    + Duration::from_secs(request.ack_deadline_seconds as u64);
            }
        }
        Ok(())
    }
}

/// Route engine logs to the test output (`RUST_LOG=debug cargo test`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `predicate` holds or `deadline` elapses.
pub async fn wait_for(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}
