use anyhow::Context;
use lapin::BasicProperties;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::amqp::{BrokerSettings, ConnectionFactory};
use crate::codec::{data_envelope, error_envelope, CodecError};
use crate::meta::{DeliveryMode, Meta};
use crate::pool::{self, ChannelPool, PooledChannel};
use crate::primitives;
use crate::rpc::{Handler, HandlerError, RequestDispatcher};
use crate::transport::{
    AmqpTransport, ConsumeOptions, DeliveryStream, Transport, TransportChannel,
};

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);

/// The sending side of the RPC layer.
///
/// A `Publisher` owns a [`ChannelPool`]: every operation checks a channel out for its own
/// duration only, so a `Publisher` can be cloned and shared across tasks freely.
///
/// # Timeouts
///
/// Checking a channel out of the pool and publishing happen under the same timeout
/// (3 seconds unless configured otherwise with [`PublisherBuilder::publish_timeout`]).
///
/// # Example
///
/// ```rust
/// use carrot_rpc::amqp::{BrokerSettings, ConnectionFactory, RabbitMqSettings};
/// use carrot_rpc::publishers::Publisher;
///
/// async fn get_publisher() -> anyhow::Result<Publisher> {
///     let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
///     Ok(Publisher::connect(&factory, &BrokerSettings::default()).await?)
/// }
/// ```
pub struct Publisher<T: Transport = AmqpTransport> {
    channel_pool: ChannelPool<T>,
    timeout: Duration,
}

impl<T: Transport> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            channel_pool: self.channel_pool.clone(),
            timeout: self.timeout,
        }
    }
}

impl Publisher<AmqpTransport> {
    /// Connect to RabbitMq with a pool of `settings.channels` channels.
    pub async fn connect(
        factory: &ConnectionFactory,
        settings: &BrokerSettings,
    ) -> Result<Self, PublisherError> {
        let transport = AmqpTransport::connect(factory)
            .await
            .map_err(PublisherError::Transport)?;
        let channel_pool = ChannelPool::new(transport, settings.channels)
            .await
            .map_err(PublisherError::Channel)?;
        Ok(Self::builder(channel_pool)
            .publish_timeout(settings.publish_timeout())
            .build())
    }
}

impl<T: Transport> Publisher<T> {
    /// Build a publisher with a pool of at most `max_channels` channels over `transport`.
    pub async fn new(transport: T, max_channels: usize) -> Result<Self, PublisherError> {
        let channel_pool = ChannelPool::new(transport, max_channels)
            .await
            .map_err(PublisherError::Channel)?;
        Ok(Self::builder(channel_pool).build())
    }

    /// Start building a [`Publisher`] on top of an existing channel pool.
    pub fn builder(channel_pool: ChannelPool<T>) -> PublisherBuilder<T> {
        PublisherBuilder::new(channel_pool)
    }

    /// Publish `body` on `meta.exchange` with routing key `meta.key`.
    ///
    /// The message is stamped with the content type, the correlation id, the reply address
    /// (`meta.queue`) and the delivery mode found in `meta`.
    #[tracing::instrument(
        level = "debug",
        name = "publisher_produce",
        skip(self, body),
        fields(exchange = %meta.exchange, key = %meta.key, correlation_id = ?meta.correlation_id)
    )]
    pub async fn produce(&self, meta: &Meta, body: &[u8]) -> Result<(), PublisherError> {
        let properties = inject_amqp_properties(meta.properties());
        let result = self
            .on_channel(|channel| async move {
                channel
                    .publish(&meta.exchange, &meta.key, properties, body)
                    .await
            })
            .await;
        match &result {
            Ok(()) => debug!(body = %String::from_utf8_lossy(body), "Message produced"),
            Err(e) => error!("Failed to produce a message: {:?}", e),
        }
        result
    }

    /// Enqueue a persistent task on the `queue` work queue, declaring it (durable) first.
    #[tracing::instrument(name = "publisher_new_task", skip(self, body))]
    pub async fn new_task(&self, queue: &str, body: &[u8]) -> Result<(), PublisherError> {
        let queue = self
            .on_channel(|channel| async move {
                primitives::declare_queue(&*channel, queue, true).await
            })
            .await?;
        let meta = Meta {
            key: queue,
            delivery_mode: DeliveryMode::Persistent,
            ..Meta::default()
        };
        self.produce(&meta, body).await
    }

    /// Publish `body` on `meta.exchange`, declaring the exchange (durable) first.
    #[tracing::instrument(name = "publisher_publish", skip(self, body))]
    pub async fn publish(&self, meta: &Meta, body: &[u8]) -> Result<(), PublisherError> {
        self.on_channel(|channel| async move {
            primitives::declare_exchange(&*channel, &meta.exchange, meta.exchange_kind.clone(), true)
                .await
        })
        .await?;
        self.produce(meta, body).await
    }

    /// Send a request expecting a reply.
    ///
    /// The request is stamped with a fresh correlation id and with `meta.queue` as its reply
    /// address. If `meta.queue` is empty a private exclusive queue is declared for the reply and
    /// consumed on the spot: its deliveries come back in [`PendingReply::deliveries`]. The
    /// private queue lives as long as the publisher's connection, borrow a reply queue from a
    /// [`Consumer`](crate::consumers::Consumer) to avoid piling them up.
    ///
    /// It returns as soon as the request is published: waiting for the reply is up to the caller
    /// (see [`RpcClient`](crate::rpc::RpcClient) for a complete round trip).
    #[tracing::instrument(name = "publisher_call_rpc", skip(self, body))]
    pub async fn call_rpc(&self, meta: &Meta, body: &[u8]) -> Result<PendingReply, PublisherError> {
        let mut meta = meta.clone();
        let mut deliveries = None;
        if meta.queue.is_empty() {
            let (queue, stream) = self
                .on_channel(|channel| async move {
                    let queue = primitives::declare_queue(&*channel, "", false).await?;
                    let options = ConsumeOptions {
                        auto_ack: true,
                        exclusive: true,
                    };
                    let stream = channel
                        .consume(&queue, options)
                        .await
                        .with_context(|| format!("Failed to consume reply queue '{queue}'"))?;
                    Ok((queue, stream))
                })
                .await?;
            meta.queue = queue;
            deliveries = Some(stream);
        }
        let correlation_id = Uuid::new_v4().to_string();
        meta.correlation_id = Some(correlation_id.clone());
        self.produce(&meta, body).await?;
        Ok(PendingReply {
            reply_to: meta.queue,
            correlation_id,
            deliveries,
        })
    }

    /// Reply with a `{"data": ...}` envelope.
    pub async fn produce_data<D: Serialize + ?Sized>(
        &self,
        meta: &Meta,
        data: &D,
    ) -> Result<(), PublisherError> {
        let body = data_envelope(&data).map_err(PublisherError::Encoding)?;
        self.produce(meta, &body).await
    }

    /// Reply with an `{"error": ...}` envelope.
    pub async fn produce_error(
        &self,
        meta: &Meta,
        error: &HandlerError,
    ) -> Result<(), PublisherError> {
        let body = error_envelope(error).map_err(PublisherError::Encoding)?;
        self.produce(meta, &body).await
    }

    /// Answer every request pulled from `deliveries` with `handler`, replying as described by
    /// `meta`.
    ///
    /// `context` is shared by all requests. If it is already behind an `Arc` pointer, it won't be
    /// "double-wrapped".
    pub fn wrap_handler<C, H>(
        &self,
        meta: Meta,
        deliveries: DeliveryStream,
        handler: H,
        context: impl Into<Arc<C>>,
    ) -> RequestDispatcher<T, C, H>
    where
        C: Send + Sync + 'static,
        H: Handler<C>,
    {
        RequestDispatcher::new(self.clone(), meta, deliveries, handler, context.into())
    }

    pub fn channel_pool(&self) -> &ChannelPool<T> {
        &self.channel_pool
    }

    /// Close the pool and its connection.
    #[tracing::instrument(name = "publisher_close", skip(self))]
    pub async fn close(&self) -> Result<(), PublisherError> {
        self.channel_pool
            .close()
            .await
            .map_err(PublisherError::Channel)
    }

    /// Run `f` on a pooled channel, checkout and operation under the publish timeout.
    async fn on_channel<F, Fut, R>(&self, f: F) -> Result<R, PublisherError>
    where
        F: FnOnce(PooledChannel<T>) -> Fut,
        Fut: Future<Output = Result<R, anyhow::Error>>,
    {
        let operation = async {
            self.channel_pool
                .with_channel(f)
                .await
                .map_err(PublisherError::Channel)?
                .map_err(PublisherError::Transport)
        };
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(PublisherError::TimeoutError),
        }
    }
}

/// Where the reply to a request sent with [`Publisher::call_rpc`] is going to show up.
pub struct PendingReply {
    /// The queue the reply is sent to.
    pub reply_to: String,
    /// The correlation id the reply carries.
    pub correlation_id: String,
    /// The deliveries of the private reply queue, if `call_rpc` had to declare one.
    /// `None` when the caller provided its own reply queue.
    pub deliveries: Option<DeliveryStream>,
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("reply_to", &self.reply_to)
            .field("correlation_id", &self.correlation_id)
            .field("private_queue", &self.deliveries.is_some())
            .finish()
    }
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Failed to acquire a healthy channel from the pool")]
    Channel(#[source] pool::Error),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Transport(#[source] anyhow::Error),
    #[error("Failed to encode the message")]
    Encoding(#[source] CodecError),
    #[error("The timeout threshold was reached while trying to publish the message")]
    TimeoutError,
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<T: Transport> {
    channel_pool: ChannelPool<T>,
    timeout: Duration,
}

impl<T: Transport> PublisherBuilder<T> {
    fn new(channel_pool: ChannelPool<T>) -> Self {
        Self {
            channel_pool,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Publisher<T> {
        Publisher {
            channel_pool: self.channel_pool,
            timeout: self.timeout,
        }
    }
}

/// Stamp a timestamp and a message id, unless they are already set.
fn inject_amqp_properties(properties: BasicProperties) -> BasicProperties {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let properties = match current_timestamp {
        Some(ct) => {
            let ts = *properties.timestamp();
            properties.with_timestamp(ts.unwrap_or(ct))
        }
        None => {
            warn!("System time is before 1970");
            properties
        }
    };

    let message_id = properties.message_id().clone();
    properties.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()))
}
