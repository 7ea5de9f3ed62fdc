//! Common data types for pubwire.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Opaque token identifying one delivery attempt of one message.
///
/// Ack ids are minted by the service per delivery; the same message
/// redelivered carries a fresh ack id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckId(pub String);

impl AckId {
    /// Borrow the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AckId {
    fn from(s: String) -> Self {
        AckId(s)
    }
}

/// A message delivered to a subscriber. Immutable once received.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Ack token for this delivery attempt.
    pub ack_id: AckId,
    /// Opaque payload.
    pub data: Bytes,
    /// Key-value attributes.
    pub attributes: HashMap<String, String>,
    /// Server-assigned message id.
    pub message_id: String,
    /// When the message was accepted by the service.
    pub publish_time: Option<DateTime<Utc>>,
    /// Ordering key, if the message was published with one.
    pub ordering_key: Option<String>,
    /// How many times this message has been delivered, starting at 1.
    /// Zero when the subscription does not track delivery attempts.
    pub delivery_attempt: u32,
    /// Wire size of the message, used for flow-control accounting.
    pub size: usize,
}

/// A message to be published.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    /// Opaque payload.
    pub data: Bytes,
    /// Key-value attributes.
    pub attributes: HashMap<String, String>,
    /// Ordering key. Requires ordering to be enabled on the publisher.
    pub ordering_key: Option<String>,
}

impl OutgoingMessage {
    /// Create a message from a payload.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the ordering key.
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_builders() {
        let msg = OutgoingMessage::new("hello")
            .with_attribute("k", "v")
            .with_ordering_key("key-a");
        assert_eq!(msg.data, Bytes::from("hello"));
        assert_eq!(msg.attributes.get("k").map(String::as_str), Some("v"));
        assert_eq!(msg.ordering_key.as_deref(), Some("key-a"));
    }

    #[test]
    fn test_ack_id_display() {
        let id = AckId::from("token-1".to_string());
        assert_eq!(id.to_string(), "token-1");
        assert_eq!(id.as_str(), "token-1");
    }
}
