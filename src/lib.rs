//! # pubwire - Streaming Pub/Sub Client Engine
//!
//! A client engine for a managed publish/subscribe messaging service:
//! the subscriber-side streaming delivery and acknowledgement machinery
//! and its publish-side counterpart.
//!
//! On the subscribe path, a [`subscriber::Subscriber`] holds a
//! bidirectional stream open to the service, admits messages under a
//! flow-control budget, keeps per-message leases alive while a
//! user-registered handler works, and coalesces ack/nack/deadline traffic
//! back onto the stream. Subscriptions with exactly-once delivery get a
//! confirmed, resolvable outcome per ack.
//!
//! On the publish path, a [`publisher::Publisher`] batches messages by
//! count, bytes and age, optionally serializes batches per ordering key,
//! and resolves a per-message receipt with the server-assigned id.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
mod backoff;
pub mod config;
pub mod error;
pub mod publisher;
pub mod subscriber;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
