//! Lease tracking and background deadline extension.
//!
//! Every admitted message holds a lease: the window during which the
//! service will not redeliver it. The [`LeaseWorker`] periodically renews
//! deadlines for messages still being processed, up to a maximum total
//! extension period, after which the lease is abandoned and the service
//! redelivers. The renewed deadline adapts to observed ack latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::ack::{AckQueue, Extension};
use super::flow::FlowPermit;
use crate::config::{LeaseConfig, MAX_STREAM_ACK_DEADLINE, MIN_STREAM_ACK_DEADLINE};

/// Percentile of the ack-latency distribution used for renewed deadlines.
const DEADLINE_PERCENTILE: f64 = 99.9;

/// Bucketed distribution of ack latencies in whole seconds.
///
/// Feeds the adaptive deadline: extensions track how long this
/// subscription's receiver actually takes.
pub struct Distribution {
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
}

impl Distribution {
    /// Create an empty distribution covering 0-600 seconds.
    pub fn new() -> Self {
        let cap = MAX_STREAM_ACK_DEADLINE.as_secs() as usize + 1;
        Self {
            buckets: (0..cap).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
        }
    }

    /// Record one observation, clamped to the bucket range.
    pub fn record(&self, seconds: u64) {
        let idx = (seconds as usize).min(self.buckets.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Value at the given percentile, or 0 when empty.
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * percentile / 100.0).ceil() as u64;
        let mut seen = 0u64;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return idx as u64;
            }
        }
        self.buckets.len() as u64 - 1
    }
}

impl Default for Distribution {
    fn default() -> Self {
        Self::new()
    }
}

struct Lease {
    _permit: FlowPermit,
    deadline: Instant,
    total_expiration: Instant,
    extensions: u32,
}

/// The set of open leases, keyed by ack id.
///
/// Mutated from the stream task (inserts), handle callbacks (forgets) and
/// the lease worker (extensions, abandonment); every mutation happens
/// under one short-lived lock.
pub(crate) struct LeaseTable {
    inner: Mutex<HashMap<String, Lease>>,
    deadline_secs: AtomicU32,
    min_extension_secs: AtomicU32,
    max_extension_secs: u32,
    expiration_padding: Duration,
    empty_notify: Notify,
}

impl LeaseTable {
    pub fn new(config: &LeaseConfig) -> Arc<Self> {
        let min = config.min_extension.as_secs().max(1) as u32;
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            deadline_secs: AtomicU32::new(min.max(MIN_STREAM_ACK_DEADLINE.as_secs() as u32)),
            min_extension_secs: AtomicU32::new(min),
            max_extension_secs: config.max_extension.as_secs() as u32,
            expiration_padding: config.expiration_padding,
            empty_notify: Notify::new(),
        })
    }

    /// Open a lease. Returns false for a duplicate delivery of an ack id
    /// already outstanding; the caller drops the copy without nacking, so
    /// the copy already being processed is unaffected, and without
    /// refreshing the total expiration, so a lost message still expires
    /// and redelivers.
    pub fn insert(
        &self,
        ack_id: String,
        permit: FlowPermit,
        initial_deadline: Duration,
        max_extension_period: Duration,
    ) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&ack_id) {
            return false;
        }
        inner.insert(
            ack_id,
            Lease {
                _permit: permit,
                deadline: now + initial_deadline,
                total_expiration: now + max_extension_period,
                extensions: 0,
            },
        );
        true
    }

    /// Close a lease, releasing its flow-control capacity. A second call
    /// for the same ack id is a no-op so capacity is never freed twice.
    pub fn forget(&self, ack_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.remove(ack_id).is_some();
        if removed && inner.is_empty() {
            self.empty_notify.notify_waiters();
        }
        removed
    }

    /// Whether the message's total expiration has passed (the lease was
    /// abandoned or is about to be). Expired messages are skipped rather
    /// than delivered: the service has likely handed them to someone else.
    pub fn is_expired(&self, ack_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.get(ack_id) {
            Some(lease) => lease.total_expiration < Instant::now(),
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Wait until no leases remain open.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.empty_notify.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Deadline currently used for receipts and renewals, in seconds.
    pub fn deadline_secs(&self) -> u32 {
        self.deadline_secs.load(Ordering::SeqCst)
    }

    /// Raise the per-extension floor; used when exactly-once delivery is
    /// enabled so confirmations have time to round-trip.
    pub fn set_min_extension_secs(&self, secs: u32) {
        self.min_extension_secs.store(secs, Ordering::SeqCst);
    }

    /// Recompute the renewal deadline from observed ack latency.
    pub fn update_deadline(&self, latency: &Distribution) -> u32 {
        let observed = latency.percentile(DEADLINE_PERCENTILE) as u32;
        let min = self.min_extension_secs.load(Ordering::SeqCst);
        let deadline = observed
            .clamp(min, self.max_extension_secs)
            .clamp(
                MIN_STREAM_ACK_DEADLINE.as_secs() as u32,
                MAX_STREAM_ACK_DEADLINE.as_secs() as u32,
            );
        self.deadline_secs.store(deadline, Ordering::SeqCst);
        deadline
    }

    /// Collect extensions for leases whose deadline falls inside the
    /// upcoming tick window, abandoning those past their total expiration.
    ///
    /// Extensions never reach past a lease's total expiration: the last
    /// renewal covers only the remaining seconds.
    pub fn collect_extensions(&self, tick: Duration) -> (Vec<Extension>, usize) {
        let now = Instant::now();
        let due_before = now + tick + self.expiration_padding;
        let extend_secs = self.deadline_secs();
        let extend_to = now + Duration::from_secs(extend_secs as u64);

        let mut by_seconds: HashMap<u32, Vec<String>> = HashMap::new();
        let mut abandoned = 0usize;

        let mut inner = self.inner.lock().unwrap();
        inner.retain(|ack_id, lease| {
            if lease.deadline > due_before {
                return true;
            }
            if lease.total_expiration <= now {
                // Out of extension budget: abandon without ack or nack and
                // let the service redeliver.
                abandoned += 1;
                return false;
            }
            let seconds = if lease.total_expiration > extend_to {
                extend_secs
            } else {
                (lease.total_expiration - now).as_secs().max(1) as u32
            };
            lease.deadline = now + Duration::from_secs(seconds as u64);
            lease.extensions += 1;
            by_seconds.entry(seconds).or_default().push(ack_id.clone());
            true
        });
        if abandoned > 0 && inner.is_empty() {
            self.empty_notify.notify_waiters();
        }
        drop(inner);

        let extensions = by_seconds
            .into_iter()
            .map(|(seconds, ack_ids)| Extension { seconds, ack_ids })
            .collect();
        (extensions, abandoned)
    }

    /// Remove and return every open lease's ack id. Used to nack all
    /// outstanding messages at shutdown.
    pub fn drain_all(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let ids = inner.keys().cloned().collect();
        inner.clear();
        self.empty_notify.notify_waiters();
        ids
    }
}

/// Background task renewing lease deadlines on a fixed period.
///
/// Owns its own lifecycle so it can be started, stopped and tested
/// independently of the stream connection.
pub(crate) struct LeaseWorker {
    pub table: Arc<LeaseTable>,
    pub queue: Arc<AckQueue>,
    pub latency: Arc<Distribution>,
    pub tick: Duration,
    pub shutdown: watch::Receiver<bool>,
}

impl LeaseWorker {
    /// Start the worker.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(tick_ms = self.tick.as_millis() as u64, "lease worker started");
            let mut ticker = interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let deadline = self.table.update_deadline(&self.latency);
                        let (extensions, abandoned) = self.table.collect_extensions(self.tick);
                        if abandoned > 0 {
                            warn!(abandoned, "abandoned leases past max extension period");
                        }
                        let renewed: usize = extensions.iter().map(|e| e.ack_ids.len()).sum();
                        if renewed > 0 {
                            debug!(renewed, deadline_secs = deadline, "extending lease deadlines");
                        }
                        for extension in extensions {
                            self.queue.push_extension(extension);
                        }
                    }
                    _ = self.shutdown.changed() => {
                        if *self.shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("lease worker stopped");
        })
    }
}

/// Tick period for the lease worker: a quarter of the stream deadline,
/// clamped to [1s, 10s].
pub(crate) fn lease_tick(stream_ack_deadline: Duration) -> Duration {
    (stream_ack_deadline / 4).clamp(Duration::from_secs(1), Duration::from_secs(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowControlConfig;
    use crate::subscriber::flow::FlowController;

    async fn permit() -> FlowPermit {
        let flow = FlowController::new(&FlowControlConfig {
            max_outstanding_messages: None,
            max_outstanding_bytes: None,
        });
        flow.admit(10).await
    }

    #[test]
    fn test_distribution_percentile() {
        let dist = Distribution::new();
        for _ in 0..99 {
            dist.record(5);
        }
        dist.record(120);
        assert_eq!(dist.percentile(50.0), 5);
        assert_eq!(dist.percentile(99.9), 120);
    }

    #[test]
    fn test_distribution_empty_is_zero() {
        let dist = Distribution::new();
        assert_eq!(dist.percentile(99.9), 0);
    }

    #[test]
    fn test_distribution_clamps_large_values() {
        let dist = Distribution::new();
        dist.record(10_000);
        assert_eq!(dist.percentile(99.9), 600);
    }

    #[tokio::test]
    async fn test_insert_and_forget() {
        let table = LeaseTable::new(&LeaseConfig::default());
        assert!(table.insert(
            "a-1".to_string(),
            permit().await,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        assert_eq!(table.len(), 1);
        assert!(table.forget("a-1"));
        assert!(!table.forget("a-1"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_rejected() {
        let table = LeaseTable::new(&LeaseConfig::default());
        assert!(table.insert(
            "a-1".to_string(),
            permit().await,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        assert!(!table.insert(
            "a-1".to_string(),
            permit().await,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_extensions_due_within_window() {
        let table = LeaseTable::new(&LeaseConfig::default());
        // Deadline inside the upcoming window: due for renewal.
        table.insert(
            "due".to_string(),
            permit().await,
            Duration::from_secs(2),
            Duration::from_secs(3600),
        );
        // Deadline far out: untouched.
        table.insert(
            "later".to_string(),
            permit().await,
            Duration::from_secs(300),
            Duration::from_secs(3600),
        );

        let (extensions, abandoned) = table.collect_extensions(Duration::from_secs(1));
        assert_eq!(abandoned, 0);
        let ids: Vec<_> = extensions.iter().flat_map(|e| e.ack_ids.clone()).collect();
        assert_eq!(ids, vec!["due".to_string()]);
        assert_eq!(extensions[0].seconds, table.deadline_secs());
    }

    #[tokio::test]
    async fn test_lease_past_total_expiration_abandoned() {
        let table = LeaseTable::new(&LeaseConfig::default());
        table.insert(
            "gone".to_string(),
            permit().await,
            Duration::from_secs(1),
            Duration::from_millis(0),
        );
        let (extensions, abandoned) = table.collect_extensions(Duration::from_secs(1));
        assert!(extensions.is_empty());
        assert_eq!(abandoned, 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_final_extension_capped_to_remaining_budget() {
        let table = LeaseTable::new(&LeaseConfig::default());
        // 5 seconds of budget left, renewal deadline is 10s: the extension
        // must not outlive the budget.
        table.insert(
            "closing".to_string(),
            permit().await,
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        let (extensions, _) = table.collect_extensions(Duration::from_secs(1));
        assert_eq!(extensions.len(), 1);
        assert!(extensions[0].seconds <= 5);
        assert!(extensions[0].seconds >= 1);
    }

    #[test]
    fn test_update_deadline_clamps() {
        let table = LeaseTable::new(&LeaseConfig::default());
        let dist = Distribution::new();
        dist.record(3);
        // Below the stream floor: clamped up.
        assert_eq!(table.update_deadline(&dist), 10);
        for _ in 0..10_000 {
            dist.record(700);
        }
        // Above the stream ceiling: clamped down.
        assert_eq!(table.update_deadline(&dist), 600);
    }

    #[test]
    fn test_min_extension_raised_for_exactly_once() {
        let table = LeaseTable::new(&LeaseConfig::default());
        table.set_min_extension_secs(60);
        let dist = Distribution::new();
        dist.record(3);
        assert_eq!(table.update_deadline(&dist), 60);
    }

    #[test]
    fn test_lease_tick_bounds() {
        assert_eq!(lease_tick(Duration::from_secs(60)), Duration::from_secs(10));
        assert_eq!(
            lease_tick(Duration::from_secs(10)),
            Duration::from_millis(2500)
        );
        assert_eq!(lease_tick(Duration::from_secs(2)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let table = LeaseTable::new(&LeaseConfig::default());
        table.insert(
            "a-1".to_string(),
            permit().await,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait_empty().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        table.forget("a-1");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_empty should complete")
            .unwrap();
    }
}
