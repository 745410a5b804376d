use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::amqp::{BrokerSettings, ConnectionFactory};
use crate::codec::{convert_to_message, ApiError, CodecError, Envelope};
use crate::consumers::{Consumer, ConsumerError};
use crate::meta::Meta;
use crate::publishers::{Publisher, PublisherError};
use crate::transport::{AmqpTransport, Transport};

/// Sends requests and waits for their replies.
///
/// Every call borrows one of the reply queues reserved by the [`Consumer`], so that at most
/// as many calls as reserved queues are in flight at once: further calls wait for a queue
/// to be released.
pub struct RpcClient<T: Transport = AmqpTransport> {
    consumer: Arc<Consumer<T>>,
    publisher: Publisher<T>,
    timeout: Duration,
}

impl<T: Transport> Clone for RpcClient<T> {
    fn clone(&self) -> Self {
        Self {
            consumer: Arc::clone(&self.consumer),
            publisher: self.publisher.clone(),
            timeout: self.timeout,
        }
    }
}

impl RpcClient<AmqpTransport> {
    /// Open a consumer connection and a publisher connection to RabbitMq.
    pub async fn connect(
        factory: &ConnectionFactory,
        settings: &BrokerSettings,
    ) -> Result<Self, anyhow::Error> {
        let consumer = Consumer::connect(factory, settings).await?;
        let publisher = Publisher::connect(factory, settings).await?;
        Ok(Self::new(consumer, publisher).with_timeout(settings.request_timeout()))
    }
}

impl<T: Transport> RpcClient<T> {
    /// If the consumer is already behind an `Arc` pointer, it won't be "double-wrapped".
    pub fn new(consumer: impl Into<Arc<Consumer<T>>>, publisher: Publisher<T>) -> Self {
        Self {
            consumer: consumer.into(),
            publisher,
            timeout: Duration::from_secs(5),
        }
    }

    /// How long [`RpcClient::call`] waits for a reply.
    /// Defaults to 5 seconds if left unspecified.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `request` as described by `meta` and wait for the reply.
    pub async fn call<Req, Resp>(&self, meta: &Meta, request: &Req) -> Result<Resp, RpcCallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_timeout(meta, request, self.timeout).await
    }

    /// Same as [`RpcClient::call`], waiting at most `timeout` for a reply queue and the reply.
    #[tracing::instrument(name = "rpc_call", skip(self, request))]
    pub async fn call_timeout<Req, Resp>(
        &self,
        meta: &Meta,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcCallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = convert_to_message(request).map_err(RpcCallError::Codec)?;
        let round_trip = async {
            let mut lease = self
                .consumer
                .get_free_queue()
                .await
                .map_err(RpcCallError::ReplyQueue)?;
            let meta = Meta {
                queue: lease.name().to_owned(),
                ..meta.clone()
            };
            let pending = self
                .publisher
                .call_rpc(&meta, &body)
                .await
                .map_err(RpcCallError::Publish)?;
            lease
                .next_reply(&pending.correlation_id)
                .await
                .map_err(|e| match e {
                    ConsumerError::ReplyQueueDisconnected => RpcCallError::Disconnected,
                    e => RpcCallError::ReplyQueue(e),
                })
        };
        let reply = match tokio::time::timeout(timeout, round_trip).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!(?timeout, "No reply before the deadline");
                return Err(RpcCallError::Timeout);
            }
        };
        reply
            .translate::<Envelope<Resp>>()
            .map_err(RpcCallError::Codec)?
            .into_result()
            .map_err(RpcCallError::Remote)
    }
}

/// Error returned by [`RpcClient::call`].
#[derive(thiserror::Error, Debug)]
pub enum RpcCallError {
    #[error("Failed to encode the request or to decode the reply")]
    Codec(#[source] CodecError),
    #[error("Failed to publish the request")]
    Publish(#[source] PublisherError),
    #[error("Failed to borrow a reply queue")]
    ReplyQueue(#[source] ConsumerError),
    #[error("No reply was received before the deadline")]
    Timeout,
    #[error("The reply queue was closed before a reply was received")]
    Disconnected,
    #[error("The request failed with status {}: {}", .0.code, .0.reason.error)]
    Remote(ApiError),
}
