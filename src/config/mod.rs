//! Configuration system for pubwire.
//!
//! All configuration is carried by plain immutable structs that are
//! validated once, when a [`crate::subscriber::Subscriber`] or
//! [`crate::publisher::Publisher`] is constructed. Defaults match the
//! behavior of the hosted service's reference clients.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Hard lower bound on the stream-level ack deadline, imposed by the service.
pub const MIN_STREAM_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Hard upper bound on the stream-level ack deadline, imposed by the service.
pub const MAX_STREAM_ACK_DEADLINE: Duration = Duration::from_secs(600);

/// Maximum number of messages accepted in a single publish request.
pub const MAX_REQUEST_ELEMENTS: usize = 1000;

/// Maximum byte size of a single publish request.
pub const MAX_REQUEST_BYTES: usize = 10 * 1000 * 1000;

/// Subscriber configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Fully-qualified subscription name,
    /// e.g. `projects/my-project/subscriptions/my-sub`.
    pub subscription: String,
    /// Ack deadline requested on the stream (10-600 seconds).
    pub stream_ack_deadline: Duration,
    /// Flow control limits for messages checked out to user code.
    pub flow_control: FlowControlConfig,
    /// Lease extension behavior.
    pub lease: LeaseConfig,
    /// Number of worker tasks running receiver callbacks.
    /// Zero means one worker per available CPU.
    pub workers: usize,
    /// Expect exactly-once delivery semantics from the subscription.
    pub exactly_once: bool,
    /// Serialize receiver invocations per ordering key.
    pub ordered_delivery: bool,
    /// Stream reconnect backoff policy.
    pub retry: RetryConfig,
    /// Shutdown behavior.
    pub shutdown: ShutdownConfig,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            subscription: String::new(),
            stream_ack_deadline: Duration::from_secs(60),
            flow_control: FlowControlConfig::default(),
            lease: LeaseConfig::default(),
            workers: 0,
            exactly_once: false,
            ordered_delivery: false,
            retry: RetryConfig::reconnect_default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl SubscriberConfig {
    /// Create a configuration for the given subscription with defaults.
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.subscription.is_empty() {
            return Err(Error::Config("subscription name is required".to_string()));
        }
        if self.stream_ack_deadline < MIN_STREAM_ACK_DEADLINE
            || self.stream_ack_deadline > MAX_STREAM_ACK_DEADLINE
        {
            return Err(Error::Config(format!(
                "stream_ack_deadline must be between {}s and {}s, got {}s",
                MIN_STREAM_ACK_DEADLINE.as_secs(),
                MAX_STREAM_ACK_DEADLINE.as_secs(),
                self.stream_ack_deadline.as_secs()
            )));
        }
        self.flow_control.validate()?;
        self.lease.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    /// Worker count with the CPU-proportional default applied.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

/// Flow control limits on messages outstanding to user code.
///
/// `None` means unlimited for that dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowControlConfig {
    /// Maximum number of outstanding messages.
    pub max_outstanding_messages: Option<u64>,
    /// Maximum total byte size of outstanding messages.
    pub max_outstanding_bytes: Option<u64>,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_outstanding_messages: Some(1000),
            max_outstanding_bytes: Some(100 * 1024 * 1024),
        }
    }
}

impl FlowControlConfig {
    /// Validate the limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_outstanding_messages == Some(0) {
            return Err(Error::Config(
                "max_outstanding_messages must be positive".to_string(),
            ));
        }
        if self.max_outstanding_bytes == Some(0) {
            return Err(Error::Config(
                "max_outstanding_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lease extension behavior for outstanding messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Total time a message's lease may be extended before it is abandoned
    /// and left for the service to redeliver.
    pub max_extension_period: Duration,
    /// Lower bound for a single deadline extension.
    pub min_extension: Duration,
    /// Upper bound for a single deadline extension.
    pub max_extension: Duration,
    /// Extensions are issued when a deadline is within this padding of
    /// expiring.
    pub expiration_padding: Duration,
    /// Cadence at which queued acks, nacks and extensions are flushed.
    pub flush_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_extension_period: Duration::from_secs(60 * 60),
            min_extension: MIN_STREAM_ACK_DEADLINE,
            max_extension: MAX_STREAM_ACK_DEADLINE,
            expiration_padding: Duration::from_secs(5),
            flush_interval: Duration::from_millis(100),
        }
    }
}

impl LeaseConfig {
    /// Validate the lease parameters.
    pub fn validate(&self) -> Result<()> {
        if self.min_extension > self.max_extension {
            return Err(Error::Config(format!(
                "min_extension ({}s) exceeds max_extension ({}s)",
                self.min_extension.as_secs(),
                self.max_extension.as_secs()
            )));
        }
        if self.max_extension > MAX_STREAM_ACK_DEADLINE {
            return Err(Error::Config(format!(
                "max_extension must not exceed {}s",
                MAX_STREAM_ACK_DEADLINE.as_secs()
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("flush_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub multiplier: f64,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
    /// Total time budget across all attempts. `None` retries forever.
    pub total_timeout: Option<Duration>,
}

impl RetryConfig {
    /// Default policy for stream reconnection: 100ms doubling up to 10s,
    /// retried indefinitely.
    pub fn reconnect_default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
            total_timeout: None,
        }
    }

    /// Default policy for publish RPCs: 100ms quadrupling up to 60s,
    /// bounded by a 600s total budget.
    pub fn publish_default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            multiplier: 4.0,
            max_backoff: Duration::from_secs(60),
            total_timeout: Some(Duration::from_secs(600)),
        }
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(Error::Config("initial_backoff must be positive".to_string()));
        }
        if self.multiplier < 1.0 {
            return Err(Error::Config("multiplier must be at least 1.0".to_string()));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(Error::Config(
                "max_backoff must be at least initial_backoff".to_string(),
            ));
        }
        Ok(())
    }
}

/// What to do with outstanding messages when a subscriber stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Wait for in-flight receiver invocations to finish, nacking whatever
    /// remains once the grace period expires.
    WaitForProcessing,
    /// Nack all outstanding messages immediately.
    NackImmediately,
}

/// Subscriber shutdown behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Shutdown mode.
    pub mode: ShutdownMode,
    /// Grace period for `WaitForProcessing`. `None` waits indefinitely.
    pub grace_period: Option<Duration>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::WaitForProcessing,
            grace_period: Some(Duration::from_secs(30)),
        }
    }
}

/// Publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Fully-qualified topic name, e.g. `projects/my-project/topics/my-topic`.
    pub topic: String,
    /// Batching thresholds.
    pub batching: BatchingConfig,
    /// Allow messages with ordering keys and serialize their batches.
    pub enable_ordering: bool,
    /// Payload compression.
    pub compression: CompressionConfig,
    /// Retry policy for publish RPCs.
    pub retry: RetryConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            batching: BatchingConfig::default(),
            enable_ordering: false,
            compression: CompressionConfig::default(),
            retry: RetryConfig::publish_default(),
        }
    }
}

impl PublisherConfig {
    /// Create a configuration for the given topic with defaults.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::Config("topic name is required".to_string()));
        }
        self.batching.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

/// Publish batching thresholds. A batch is flushed as soon as any one of
/// the three is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Maximum number of messages per batch.
    pub max_messages: usize,
    /// Byte size at which a batch is flushed.
    pub max_bytes: usize,
    /// Longest a batch may wait for more messages before being flushed.
    pub max_delay: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_bytes: 1000,
            max_delay: Duration::from_millis(1),
        }
    }
}

impl BatchingConfig {
    /// Validate the thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.max_messages == 0 {
            return Err(Error::Config("max_messages must be positive".to_string()));
        }
        if self.max_messages > MAX_REQUEST_ELEMENTS {
            return Err(Error::Config(format!(
                "max_messages must not exceed {}",
                MAX_REQUEST_ELEMENTS
            )));
        }
        if self.max_bytes == 0 {
            return Err(Error::Config("max_bytes must be positive".to_string()));
        }
        if self.max_delay.is_zero() {
            return Err(Error::Config("max_delay must be positive".to_string()));
        }
        Ok(())
    }
}

/// Payload compression for publish requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Enable gzip compression of publish requests.
    pub enabled: bool,
    /// Batches smaller than this are sent uncompressed.
    pub min_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_bytes: 240,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_defaults_validate() {
        let config = SubscriberConfig::new("projects/p/subscriptions/s");
        assert!(config.validate().is_ok());
        assert_eq!(config.stream_ack_deadline, Duration::from_secs(60));
    }

    #[test]
    fn test_subscription_name_required() {
        let config = SubscriberConfig::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_stream_deadline_bounds() {
        let mut config = SubscriberConfig::new("projects/p/subscriptions/s");
        config.stream_ack_deadline = Duration::from_secs(5);
        assert!(config.validate().is_err());
        config.stream_ack_deadline = Duration::from_secs(601);
        assert!(config.validate().is_err());
        config.stream_ack_deadline = Duration::from_secs(10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_flow_limits_rejected() {
        let mut config = SubscriberConfig::new("projects/p/subscriptions/s");
        config.flow_control.max_outstanding_messages = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_publisher_defaults_validate() {
        let config = PublisherConfig::new("projects/p/topics/t");
        assert!(config.validate().is_ok());
        assert_eq!(config.batching.max_messages, 100);
        assert_eq!(config.batching.max_bytes, 1000);
    }

    #[test]
    fn test_batching_limits() {
        let mut config = PublisherConfig::new("projects/p/topics/t");
        config.batching.max_messages = MAX_REQUEST_ELEMENTS + 1;
        assert!(config.validate().is_err());
        config.batching.max_messages = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_config_validation() {
        let mut retry = RetryConfig::reconnect_default();
        assert!(retry.validate().is_ok());
        retry.multiplier = 0.5;
        assert!(retry.validate().is_err());
    }
}
