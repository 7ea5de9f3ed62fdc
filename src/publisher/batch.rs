//! Pending publish batches.

use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::api::proto;
use crate::config::{BatchingConfig, MAX_REQUEST_BYTES, MAX_REQUEST_ELEMENTS};
use crate::error::Result;

/// Completion side of one published message: resolved with the
/// server-assigned message id or the publish failure.
pub(crate) type Completion = oneshot::Sender<Result<String>>;

/// A batch still accepting messages for one topic (and, under ordering,
/// one ordering key).
pub(crate) struct PendingBatch {
    messages: Vec<proto::PubsubMessage>,
    completions: Vec<Completion>,
    bytes: usize,
    created_at: Instant,
    ordering_key: String,
}

impl PendingBatch {
    /// Start an empty batch. Its age is measured from now.
    pub fn new(ordering_key: String) -> Self {
        Self {
            messages: Vec::new(),
            completions: Vec::new(),
            bytes: 0,
            created_at: Instant::now(),
            ordering_key,
        }
    }

    /// Whether adding a message of `size` bytes would push the batch past
    /// the hard per-request limits.
    pub fn would_overflow(&self, size: usize) -> bool {
        !self.messages.is_empty()
            && (self.bytes + size > MAX_REQUEST_BYTES
                || self.messages.len() + 1 > MAX_REQUEST_ELEMENTS)
    }

    /// Append a message.
    pub fn push(&mut self, message: proto::PubsubMessage, size: usize, completion: Completion) {
        self.messages.push(message);
        self.completions.push(completion);
        self.bytes += size;
    }

    /// Whether a configured threshold has been hit.
    pub fn is_full(&self, config: &BatchingConfig) -> bool {
        self.messages.len() >= config.max_messages || self.bytes >= config.max_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// When this batch must be flushed regardless of fill level.
    pub fn deadline(&self, max_delay: Duration) -> Instant {
        self.created_at + max_delay
    }

    /// Close the batch for sending.
    pub fn seal(self) -> SealedBatch {
        SealedBatch {
            messages: self.messages,
            completions: self.completions,
            bytes: self.bytes,
            ordering_key: self.ordering_key,
        }
    }

    /// Fail every message in the batch without sending it.
    pub fn fail(self, mut make_error: impl FnMut() -> crate::error::Error) {
        for completion in self.completions {
            let _ = completion.send(Err(make_error()));
        }
    }
}

/// A batch closed for sending.
pub(crate) struct SealedBatch {
    pub messages: Vec<proto::PubsubMessage>,
    pub completions: Vec<Completion>,
    pub bytes: usize,
    pub ordering_key: String,
}

impl SealedBatch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }
}
