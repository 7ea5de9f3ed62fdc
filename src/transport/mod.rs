//! Transport seam between the engine and the service.
//!
//! The engine never talks to tonic directly; it goes through the
//! [`PubsubTransport`] trait so tests can substitute an in-memory service
//! with real lease and redelivery semantics.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use crate::api::proto;

pub mod grpc;

pub use grpc::GrpcTransport;

/// Inbound half of a streaming-pull call.
pub type ResponseStream =
    Pin<Box<dyn Stream<Item = std::result::Result<proto::StreamingPullResponse, Status>> + Send>>;

/// The RPC surface the engine consumes.
///
/// One unary publish call, the streaming-pull bidi call, and the unary
/// subscriber calls that back the synchronous alternative to streaming.
#[async_trait]
pub trait PubsubTransport: Send + Sync + 'static {
    /// Open a bidirectional streaming-pull call. The engine feeds requests
    /// through the channel backing `requests`; responses arrive on the
    /// returned stream until the call ends.
    async fn streaming_pull(
        &self,
        requests: ReceiverStream<proto::StreamingPullRequest>,
    ) -> std::result::Result<ResponseStream, Status>;

    /// Publish a batch of messages. `compress` requests gzip encoding of
    /// the request body; the service consumes the bytes identically either
    /// way.
    async fn publish(
        &self,
        request: proto::PublishRequest,
        compress: bool,
    ) -> std::result::Result<proto::PublishResponse, Status>;

    /// Pull messages without a stream.
    async fn pull(
        &self,
        request: proto::PullRequest,
    ) -> std::result::Result<proto::PullResponse, Status>;

    /// Acknowledge messages by ack id.
    async fn acknowledge(
        &self,
        request: proto::AcknowledgeRequest,
    ) -> std::result::Result<(), Status>;

    /// Modify the ack deadline for messages. Deadline zero nacks them.
    async fn modify_ack_deadline(
        &self,
        request: proto::ModifyAckDeadlineRequest,
    ) -> std::result::Result<(), Status>;
}
