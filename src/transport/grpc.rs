//! gRPC implementation of the transport seam.

use async_trait::async_trait;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::CompressionEncoding;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::debug;

use crate::api::proto;
use crate::api::proto::publisher_client::PublisherClient;
use crate::api::proto::subscriber_client::SubscriberClient;
use crate::error::Result;

use super::{PubsubTransport, ResponseStream};

/// Transport backed by a tonic channel.
///
/// Clients are cheap handles over the shared channel, so one is created
/// per call. Compression is a property of the client handle, so the
/// publish path picks between a plain and a gzip-sending client.
#[derive(Clone)]
pub struct GrpcTransport {
    channel: Channel,
}

impl GrpcTransport {
    /// Connect to the service at the given endpoint,
    /// e.g. `https://pubsub.googleapis.com` or a local emulator address.
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        debug!(endpoint = %endpoint, "connecting transport channel");
        let channel = Endpoint::from_shared(endpoint)
            .map_err(|e| crate::error::Error::Config(format!("Invalid endpoint: {}", e)))?
            .keep_alive_while_idle(true)
            .http2_keep_alive_interval(Duration::from_secs(300))
            .connect()
            .await?;
        Ok(Self { channel })
    }

    /// Wrap an already-connected channel.
    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    fn subscriber(&self) -> SubscriberClient<Channel> {
        SubscriberClient::new(self.channel.clone())
    }

    fn publisher(&self, compress: bool) -> PublisherClient<Channel> {
        let client = PublisherClient::new(self.channel.clone());
        if compress {
            client.send_compressed(CompressionEncoding::Gzip)
        } else {
            client
        }
    }
}

#[async_trait]
impl PubsubTransport for GrpcTransport {
    async fn streaming_pull(
        &self,
        requests: ReceiverStream<proto::StreamingPullRequest>,
    ) -> std::result::Result<ResponseStream, Status> {
        let response = self.subscriber().streaming_pull(requests).await?;
        Ok(Box::pin(response.into_inner()))
    }

    async fn publish(
        &self,
        request: proto::PublishRequest,
        compress: bool,
    ) -> std::result::Result<proto::PublishResponse, Status> {
        let response = self.publisher(compress).publish(request).await?;
        Ok(response.into_inner())
    }

    async fn pull(
        &self,
        request: proto::PullRequest,
    ) -> std::result::Result<proto::PullResponse, Status> {
        let response = self.subscriber().pull(request).await?;
        Ok(response.into_inner())
    }

    async fn acknowledge(
        &self,
        request: proto::AcknowledgeRequest,
    ) -> std::result::Result<(), Status> {
        self.subscriber().acknowledge(request).await?;
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        request: proto::ModifyAckDeadlineRequest,
    ) -> std::result::Result<(), Status> {
        self.subscriber().modify_ack_deadline(request).await?;
        Ok(())
    }
}
