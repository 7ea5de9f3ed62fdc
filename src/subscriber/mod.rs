//! Streaming delivery and acknowledgement engine.
//!
//! A [`Subscriber`] opens a long-lived bidirectional stream to the
//! service, admits messages past client-side flow control, keeps
//! per-message leases alive while user code works, and routes ack/nack
//! traffic back onto the stream. Under exactly-once delivery every
//! ack/nack carries a resolvable outcome.
//!
//! Messages are handed to a user-registered handler function as
//! `(message, handle)` pairs on a bounded worker pool; a slow handler
//! never stalls ack traffic for other messages.

pub mod ack;
mod dispatch;
mod flow;
mod lease;
mod stream;

pub use ack::{AckError, AckHandle, AckOutcome};
pub use stream::ConnectionState;

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ShutdownMode, SubscriberConfig};
use crate::error::{Error, Result};
use crate::transport::PubsubTransport;
use crate::types::ReceivedMessage;

use ack::{AckEntry, AckQueue};
use dispatch::MessageDispatcher;
use flow::FlowController;
use lease::{lease_tick, Distribution, LeaseTable, LeaseWorker};
use stream::StreamingPullConnection;

/// User-registered message handler, invoked once per delivery with the
/// message and its acknowledgement capability.
pub type MessageHandler =
    Arc<dyn Fn(ReceivedMessage, AckHandle) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(ReceivedMessage, AckHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message, ack| f(message, ack).boxed())
}

/// Synchronous alternative to streaming delivery: one unary pull.
///
/// Returned messages are leased at the subscription's ack deadline but not
/// tracked by any engine; acknowledge them with
/// [`crate::transport::PubsubTransport::acknowledge`] (or let them expire
/// and redeliver).
pub async fn pull_once(
    transport: &dyn PubsubTransport,
    subscription: &str,
    max_messages: u32,
) -> Result<Vec<ReceivedMessage>> {
    let response = transport
        .pull(crate::api::proto::PullRequest {
            subscription: subscription.to_string(),
            max_messages: max_messages.min(i32::MAX as u32) as i32,
        })
        .await?;
    Ok(response
        .received_messages
        .into_iter()
        .filter_map(crate::api::received_from_proto)
        .collect())
}

/// A running subscription: stream connection, lease worker and dispatch
/// pool. Construction validates the configuration and starts everything;
/// [`Subscriber::stop`] shuts down cooperatively.
pub struct Subscriber {
    config: Arc<SubscriberConfig>,
    flow: Arc<FlowController>,
    leases: Arc<LeaseTable>,
    queue: Arc<AckQueue>,
    dispatcher: Arc<MessageDispatcher>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
    errors_rx: Option<mpsc::UnboundedReceiver<Error>>,
    tasks: Vec<JoinHandle<()>>,
    worker_tasks: Vec<JoinHandle<()>>,
}

impl Subscriber {
    /// Validate the configuration and start receiving.
    pub fn start(
        config: SubscriberConfig,
        transport: Arc<dyn PubsubTransport>,
        handler: MessageHandler,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        info!(subscription = %config.subscription, "starting subscriber");

        let flow = Arc::new(FlowController::new(&config.flow_control));
        let leases = LeaseTable::new(&config.lease);
        let queue = AckQueue::new();
        let latency = Arc::new(Distribution::new());
        let exactly_once = Arc::new(AtomicBool::new(config.exactly_once));
        let ordered = Arc::new(AtomicBool::new(config.ordered_delivery));
        if config.exactly_once {
            leases.set_min_extension_secs(60);
        }

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let dispatcher = MessageDispatcher::new(
            handler,
            queue.clone(),
            leases.clone(),
            flow.clone(),
            latency.clone(),
            exactly_once.clone(),
            ordered.clone(),
            errors_tx.clone(),
            config.lease.max_extension_period,
        );

        let mut tasks = Vec::new();
        tasks.push(dispatcher.spawn_feed(shutdown_rx.clone()));
        let worker_tasks = dispatcher.spawn_workers(config.effective_workers());
        tasks.push(
            LeaseWorker {
                table: leases.clone(),
                queue: queue.clone(),
                latency,
                tick: lease_tick(config.stream_ack_deadline),
                shutdown: shutdown_rx.clone(),
            }
            .spawn(),
        );

        let connection = StreamingPullConnection {
            transport,
            config: config.clone(),
            queue: queue.clone(),
            leases: leases.clone(),
            dispatcher: dispatcher.clone(),
            exactly_once,
            ordered,
            client_id: Uuid::new_v4().to_string(),
            state_tx,
            errors: errors_tx,
            shutdown: shutdown_rx,
        };
        tasks.push(tokio::spawn(connection.run()));

        Ok(Self {
            config,
            flow,
            leases,
            queue,
            dispatcher,
            shutdown_tx,
            state_rx,
            errors_rx: Some(errors_rx),
            tasks,
            worker_tasks,
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Take the permanent-error channel. Permanent stream failures and
    /// receiver panics arrive here; transient problems are retried
    /// internally and never surface.
    pub fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors_rx.take()
    }

    /// Currently outstanding (message count, byte size) checked out to
    /// user code.
    pub fn outstanding(&self) -> (u64, u64) {
        self.flow.outstanding()
    }

    /// Stop cooperatively: no new messages are admitted, in-flight
    /// receiver invocations finish per the configured shutdown mode, and
    /// final ack/nack traffic is drained before the transport closes.
    pub async fn stop(mut self) {
        info!(subscription = %self.config.subscription, "stopping subscriber");
        self.dispatcher.stop_accepting();

        match self.config.shutdown.mode {
            ShutdownMode::WaitForProcessing => match self.config.shutdown.grace_period {
                Some(grace) => {
                    if timeout(grace, self.leases.wait_empty()).await.is_err() {
                        warn!(
                            remaining = self.leases.len(),
                            "grace period expired; nacking outstanding messages"
                        );
                        self.nack_outstanding();
                    }
                }
                None => self.leases.wait_empty().await,
            },
            ShutdownMode::NackImmediately => self.nack_outstanding(),
        }

        let _ = self.shutdown_tx.send(true);
        self.dispatcher.close();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        // A receiver still running after its message was nacked is left to
        // finish in the background; its late ack goes nowhere.
        for worker in self.worker_tasks.drain(..) {
            if timeout(Duration::from_secs(1), worker).await.is_err() {
                warn!("receiver still running at shutdown; detaching");
            }
        }
        info!(subscription = %self.config.subscription, "subscriber stopped");
    }

    fn nack_outstanding(&self) {
        for ack_id in self.leases.drain_all() {
            self.queue.push_nack(AckEntry { ack_id, slot: None });
        }
    }
}
