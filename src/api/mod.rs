//! Wire-level API surface.
//!
//! Contains the generated protobuf bindings for the pub/sub v1 protocol
//! and the conversions between wire messages and crate types. Only the
//! messages the delivery and publish engines exchange with the service are
//! compiled; administrative RPCs are out of scope.

// Include generated protobuf code
/// Generated Protocol Buffer definitions for the pub/sub v1 API.
///
/// This module contains the automatically generated Rust bindings for the
/// Publisher and Subscriber streaming services.
#[allow(clippy::all, unused_imports, dead_code, missing_docs)]
pub mod proto {
    include!("generated/google.pubsub.v1.rs");
}

use chrono::DateTime;
use prost::Message as _;

use crate::types::{AckId, OutgoingMessage, ReceivedMessage};

/// Convert a wire message into the crate's received-message type.
///
/// The flow-control size is the encoded size of the inner message, so
/// accounting matches what actually crossed the wire.
pub fn received_from_proto(received: proto::ReceivedMessage) -> Option<ReceivedMessage> {
    let message = received.message?;
    let size = message.encoded_len();
    let publish_time = message
        .publish_time
        .and_then(|ts| DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32));
    Some(ReceivedMessage {
        ack_id: AckId(received.ack_id),
        data: message.data.into(),
        attributes: message.attributes,
        message_id: message.message_id,
        publish_time,
        ordering_key: if message.ordering_key.is_empty() {
            None
        } else {
            Some(message.ordering_key)
        },
        delivery_attempt: received.delivery_attempt.max(0) as u32,
        size,
    })
}

/// Convert an outgoing message into its wire form.
pub fn outgoing_to_proto(message: OutgoingMessage) -> proto::PubsubMessage {
    proto::PubsubMessage {
        data: message.data.to_vec(),
        attributes: message.attributes,
        message_id: String::new(),
        publish_time: None,
        ordering_key: message.ordering_key.unwrap_or_default(),
    }
}

/// Encoded size of a wire message, used against batching thresholds.
pub fn message_size(message: &proto::PubsubMessage) -> usize {
    message.encoded_len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_round_trip_fields() {
        let wire = proto::ReceivedMessage {
            ack_id: "ack-1".to_string(),
            message: Some(proto::PubsubMessage {
                data: b"payload".to_vec(),
                attributes: [("k".to_string(), "v".to_string())].into_iter().collect(),
                message_id: "m-1".to_string(),
                publish_time: Some(prost_types::Timestamp {
                    seconds: 1_700_000_000,
                    nanos: 0,
                }),
                ordering_key: "key-a".to_string(),
            }),
            delivery_attempt: 2,
        };
        let msg = received_from_proto(wire).unwrap();
        assert_eq!(msg.ack_id.as_str(), "ack-1");
        assert_eq!(&msg.data[..], b"payload");
        assert_eq!(msg.message_id, "m-1");
        assert_eq!(msg.ordering_key.as_deref(), Some("key-a"));
        assert_eq!(msg.delivery_attempt, 2);
        assert!(msg.size > 0);
        assert!(msg.publish_time.is_some());
    }

    #[test]
    fn test_received_without_message_is_dropped() {
        let wire = proto::ReceivedMessage {
            ack_id: "ack-1".to_string(),
            message: None,
            delivery_attempt: 0,
        };
        assert!(received_from_proto(wire).is_none());
    }

    #[test]
    fn test_empty_ordering_key_is_none() {
        let wire = proto::ReceivedMessage {
            ack_id: "ack-2".to_string(),
            message: Some(proto::PubsubMessage {
                data: b"x".to_vec(),
                ..Default::default()
            }),
            delivery_attempt: 1,
        };
        let msg = received_from_proto(wire).unwrap();
        assert_eq!(msg.ordering_key, None);
    }
}
