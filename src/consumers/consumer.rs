use anyhow::Context;
use deadpool::unmanaged::Pool;
use tracing::warn;

use super::reply_queue::{ReplyQueue, ReplyQueueLease};
use super::ConsumerError;
use crate::amqp::{BrokerSettings, ConnectionFactory};
use crate::meta::Meta;
use crate::pool::clamp_size;
use crate::primitives;
use crate::transport::{AmqpTransport, ConsumeOptions, DeliveryStream, Transport, TransportChannel};

/// The receiving side of the RPC layer.
///
/// A `Consumer` owns its connection and a single long-lived channel, used for every queue it
/// consumes from. It also reserves a set of exclusive reply queues at start-up: one is lent to
/// each outstanding RPC call (see [`Consumer::get_free_queue`]).
pub struct Consumer<T: Transport = AmqpTransport> {
    transport: T,
    channel: T::Channel,
    reply_queues: Pool<ReplyQueue>,
    reply_queue_names: Vec<String>,
}

impl Consumer<AmqpTransport> {
    /// Connect to RabbitMq and reserve `settings.reply_queues` reply queues.
    pub async fn connect(
        factory: &ConnectionFactory,
        settings: &BrokerSettings,
    ) -> Result<Self, ConsumerError> {
        let transport = AmqpTransport::connect(factory)
            .await
            .map_err(ConsumerError::Channel)?;
        Self::new(transport, settings.reply_queues).await
    }
}

impl<T: Transport> Consumer<T> {
    /// Open the consumer channel on `transport` and reserve `reply_queues` exclusive reply
    /// queues, clamped into `[4, 30]`.
    ///
    /// The connection is closed if any of this fails.
    #[tracing::instrument(name = "consumer_new", skip(transport))]
    pub async fn new(transport: T, reply_queues: usize) -> Result<Self, ConsumerError> {
        let reserved = async {
            let channel = transport
                .create_channel()
                .await
                .map_err(ConsumerError::Channel)?;
            let queues = reserve_reply_queues(&channel, clamp_size(reply_queues)).await?;
            Ok::<_, ConsumerError>((channel, queues))
        }
        .await;
        let (channel, queues) = match reserved {
            Ok(reserved) => reserved,
            Err(e) => {
                if let Err(close_error) = transport.close().await {
                    warn!("Failed to close the consumer connection: {:?}", close_error);
                }
                return Err(e);
            }
        };
        let reply_queue_names = queues.iter().map(|q| q.name.clone()).collect();

        Ok(Self {
            transport,
            channel,
            reply_queues: Pool::from(queues),
            reply_queue_names,
        })
    }

    /// Start consuming from `queue`.
    ///
    /// With `auto_ack` the broker considers messages acknowledged as soon as they are delivered.
    #[tracing::instrument(name = "consumer_consume", skip(self))]
    pub async fn consume(
        &self,
        queue: &str,
        auto_ack: bool,
        exclusive: bool,
    ) -> Result<DeliveryStream, ConsumerError> {
        self.channel
            .consume(queue, ConsumeOptions { auto_ack, exclusive })
            .await
            .with_context(|| format!("Failed to consume queue '{queue}'"))
            .map_err(ConsumerError::Transport)
    }

    /// Become one of the competing workers of the `queue` work queue.
    ///
    /// The queue is declared durable and shared, like [`Publisher::new_task`] does, so producers
    /// and workers can declare it in any order. The channel holds at most `prefetch_count`
    /// unacknowledged deliveries and deliveries must be acknowledged explicitly.
    ///
    /// [`Publisher::new_task`]: crate::publishers::Publisher::new_task
    #[tracing::instrument(name = "consumer_work_on_task", skip(self))]
    pub async fn work_on_task(
        &self,
        queue: &str,
        prefetch_count: u16,
    ) -> Result<DeliveryStream, ConsumerError> {
        let queue = primitives::declare_queue(&self.channel, queue, true)
            .await
            .map_err(ConsumerError::Transport)?;
        primitives::set_qos(&self.channel, prefetch_count, 0)
            .await
            .map_err(ConsumerError::Transport)?;
        self.consume(&queue, false, false).await
    }

    /// Receive everything published on `meta.exchange` with routing key `meta.key`.
    ///
    /// The exchange is declared (durable), then a private queue is bound to it.
    /// Deliveries are acknowledged automatically.
    #[tracing::instrument(name = "consumer_subscribe", skip(self))]
    pub async fn subscribe(&self, meta: &Meta) -> Result<DeliveryStream, ConsumerError> {
        primitives::declare_exchange(&self.channel, &meta.exchange, meta.exchange_kind.clone(), true)
            .await
            .map_err(ConsumerError::Transport)?;
        let queue = primitives::declare_queue(&self.channel, "", false)
            .await
            .map_err(ConsumerError::Transport)?;
        let binding = Meta {
            queue,
            ..meta.clone()
        };
        primitives::bind_queue(&self.channel, &binding)
            .await
            .map_err(ConsumerError::Transport)?;
        self.consume(&binding.queue, true, false).await
    }

    /// Borrow one of the reserved reply queues.
    ///
    /// Waits until a queue is released if all of them are lent.
    pub async fn get_free_queue(&self) -> Result<ReplyQueueLease, ConsumerError> {
        self.reply_queues
            .get()
            .await
            .map(ReplyQueueLease)
            .map_err(|_| ConsumerError::ReplyQueuesClosed)
    }

    /// The names of every reserved reply queue, lent or not.
    pub fn list_all_queues(&self) -> &[String] {
        &self.reply_queue_names
    }

    /// The channel every queue is consumed on.
    pub fn channel(&self) -> &T::Channel {
        &self.channel
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Close the connection: every delivery stream handed out by this consumer ends.
    #[tracing::instrument(name = "consumer_close", skip(self))]
    pub async fn close(&self) -> Result<(), ConsumerError> {
        self.transport
            .close()
            .await
            .map_err(ConsumerError::Transport)
    }
}

/// Declare `size` exclusive queues on `channel` and start consuming them.
async fn reserve_reply_queues<C: TransportChannel>(
    channel: &C,
    size: usize,
) -> Result<Vec<ReplyQueue>, ConsumerError> {
    let mut queues = Vec::with_capacity(size);
    for _ in 0..size {
        let name = primitives::declare_queue(channel, "", false)
            .await
            .map_err(ConsumerError::Transport)?;
        let deliveries = channel
            .consume(
                &name,
                ConsumeOptions {
                    auto_ack: true,
                    exclusive: true,
                },
            )
            .await
            .with_context(|| format!("Failed to consume reply queue '{name}'"))
            .map_err(ConsumerError::Transport)?;
        queues.push(ReplyQueue { name, deliveries });
    }
    Ok(queues)
}
