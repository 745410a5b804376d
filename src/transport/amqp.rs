//! [`Transport`] implementation over a [`lapin`] connection to RabbitMq.
use anyhow::Context;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use tracing::warn;
use uuid::Uuid;

use super::{
    Access, Acker, Acknowledge, ConsumeOptions, Delivery, DeliveryStream, Durability,
    HealthStatus, QueueOptions, Transport, TransportChannel,
};
use crate::amqp::ConnectionFactory;

/// A connection to a RabbitMq broker.
///
/// Connections should be re-used across multiple channels given the initial setup cost.
pub struct AmqpTransport(lapin::Connection);

impl AmqpTransport {
    /// Dial the broker described by `factory`.
    pub async fn connect(factory: &ConnectionFactory) -> Result<Self, anyhow::Error> {
        factory.new_connection().await.map(Self)
    }

    /// Get access to the underlying raw connection
    pub fn raw(&self) -> &lapin::Connection {
        &self.0
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    type Channel = AmqpChannel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<AmqpChannel, anyhow::Error> {
        let channel = self
            .0
            .create_channel()
            .await
            .context("Failed to open a channel on the RabbitMq connection.")?;
        Ok(AmqpChannel(channel))
    }

    fn status(&self) -> HealthStatus {
        if self.0.status().connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    #[tracing::instrument(name = "rabbitmq_close_connection", skip(self))]
    async fn close(&self) -> Result<(), anyhow::Error> {
        // Reply code 200 - REPLY_SUCCESS
        self.0.close(200, "closing connection").await?;
        Ok(())
    }
}

/// A RabbitMq channel.
#[derive(Clone)]
pub struct AmqpChannel(lapin::Channel);

impl AmqpChannel {
    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.0
    }
}

#[async_trait::async_trait]
impl TransportChannel for AmqpChannel {
    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self))]
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: options.durability == Durability::Durable,
            exclusive: options.access == Access::Exclusive,
            auto_delete: false,
            nowait: false,
        };
        let queue = self
            .0
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_owned())
    }

    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self))]
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error> {
        let options = ExchangeDeclareOptions {
            passive: false,
            durable,
            auto_delete: false,
            internal: false,
            nowait: false,
        };
        self.0
            .exchange_declare(name, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        let options = QueueBindOptions { nowait: false };
        self.0
            .queue_bind(queue, exchange, routing_key, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_set_qos", skip(self))]
    async fn set_qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<(), anyhow::Error> {
        if prefetch_size != 0 {
            warn!(prefetch_size, "RabbitMq does not implement prefetch size limits, ignoring it");
        }
        self.0
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", name = "rabbitmq_publish", skip(self, properties, payload))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        payload: &[u8],
    ) -> Result<(), anyhow::Error> {
        let options = BasicPublishOptions {
            mandatory: false,
            // The immediate flag was dropped in RabbitMQ 3.0.
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        // Publisher confirms are not enabled on our channels: awaiting the confirm
        // only makes sure the frame has been sent.
        self.0
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip(self))]
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let consumer = self
            .0
            .basic_consume(
                queue,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    fn status(&self) -> HealthStatus {
        if self.0.status().connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
            acker: Acker::new(AmqpAcker(value.acker)),
        }
    }
}
