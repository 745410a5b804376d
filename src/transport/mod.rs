//! The broker capabilities `carrot-rpc` is built on.
//!
//! Everything above this module (pool, consumer, publisher, dispatcher) only talks to a broker
//! through [`Transport`] and [`TransportChannel`].
//! [`AmqpTransport`] implements them on top of [`lapin`] for RabbitMq, while [`InMemoryBroker`]
//! provides an in-process broker that is handy in tests.
//!
//! [`lapin`]: https://docs.rs/crate/lapin
mod amqp;
mod delivery;
pub mod memory;

pub use amqp::{AmqpChannel, AmqpTransport};
pub use delivery::{Acker, Acknowledge, Delivery, DeliveryStream};
pub use lapin::ExchangeKind;
pub use memory::InMemoryBroker;

use lapin::BasicProperties;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// A live session with a message broker, able to open multiplexed channels.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The channel type opened over this connection.
    type Channel: TransportChannel;

    /// Open a new channel on the connection.
    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    fn status(&self) -> HealthStatus;

    /// Close the connection, and every channel opened on it.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A multiplexed sub-session of a [`Transport`] connection.
///
/// Methods follow AMQP 0-9-1 semantics.
#[async_trait::async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    /// Declare a queue and return its name.
    ///
    /// If `name` is empty the broker picks a name for the queue.
    async fn declare_queue(&self, name: &str, options: QueueOptions)
        -> Result<String, anyhow::Error>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    async fn set_qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<(), anyhow::Error>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        payload: &[u8],
    ) -> Result<(), anyhow::Error>;

    /// Start consuming from `queue`.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, anyhow::Error>;

    fn status(&self) -> HealthStatus;
}

#[derive(Clone, PartialEq, Eq, Debug)]
/// Configuration options when declaring a new queue.
pub struct QueueOptions {
    /// Will the queue survive a broker restart?
    pub durability: Durability,
    pub access: Access,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durability: Durability::Transient,
            access: Access::Shared,
        }
    }
}

/// Will the queue survive a broker restart?
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Durability {
    /// The queue survives a broker restart.
    ///
    /// Durable queues will be recovered on node boot, including messages in them published as
    /// persistent.
    Durable,
    /// Transient queues are deleted on node boot, together with their messages.
    Transient,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Access {
    /// The queue is used by only one connection and it will be deleted when that connection closes.
    Exclusive,
    /// The queue can be used by multiple connections concurrently.
    Shared,
}

/// Options for [`TransportChannel::consume`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ConsumeOptions {
    /// The broker considers a message acknowledged as soon as it is delivered.
    pub auto_ack: bool,
    /// Request exclusive consumer access to the queue.
    pub exclusive: bool,
}
