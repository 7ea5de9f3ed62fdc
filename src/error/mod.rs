//! Error types for pubwire.

use thiserror::Error;

/// Result type for pubwire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pubwire.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// RPC error returned by the service.
    #[error("RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    /// Transport-level connection error.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Message exceeds the maximum request size.
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A message carried an ordering key but ordering is not enabled.
    #[error("Ordering key set but message ordering is not enabled on this publisher")]
    OrderingNotEnabled,

    /// Publishing for this ordering key is paused after a batch failure.
    #[error("Publishing paused for ordering key {0:?}; call resume_publish to retry")]
    OrderingKeyPaused(String),

    /// The publisher has been shut down.
    #[error("Publisher is shut down")]
    PublisherShutdown,

    /// The subscriber has been stopped.
    #[error("Subscriber is stopped")]
    SubscriberStopped,

    /// The receiver callback panicked while processing a message.
    #[error("Receiver panicked while processing message {0}")]
    ReceiverPanic(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Whether a gRPC status is a transient failure worth retrying.
///
/// Transient failures are handled internally with backoff and never
/// surface to callers except as latency; everything else is permanent
/// and terminates the affected stream or publish path.
pub fn is_retryable(status: &tonic::Status) -> bool {
    use tonic::Code;
    matches!(
        status.code(),
        Code::DeadlineExceeded
            | Code::Internal
            | Code::Cancelled
            | Code::ResourceExhausted
            | Code::Aborted
            | Code::Unknown
            | Code::Unavailable
    )
}
