use amq_protocol_types::{DeliveryTag, ShortString};
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::fmt;
use std::sync::Arc;

use crate::codec::{translate_message, CodecError};

/// The stream of messages returned when consuming from a queue.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// Settles a delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), anyhow::Error>;

    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error>;
}

/// Handle used to ack/nack a [`Delivery`].
///
/// Cheap to clone: all clones settle the same delivery.
#[derive(Clone)]
pub struct Acker(Arc<dyn Acknowledge>);

impl Acker {
    pub fn new(inner: impl Acknowledge) -> Self {
        Self(Arc::new(inner))
    }

    pub async fn ack(&self) -> Result<(), anyhow::Error> {
        self.0.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.0.nack(requeue).await
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Acker")
    }
}

/// A received AMQP message.
#[derive(Debug)]
pub struct Delivery {
    /// The delivery tag of the message.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,

    // The dispatcher settles the message once its reply has been produced.
    pub(crate) acker: Acker,
}

impl Delivery {
    /// The correlation id the sender attached to the message, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties
            .correlation_id()
            .as_ref()
            .map(ShortString::as_str)
    }

    /// The address the sender expects a reply on, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to().as_ref().map(ShortString::as_str)
    }

    /// Deserialize the JSON payload.
    pub fn translate<T: serde::de::DeserializeOwned>(&self) -> Result<T, CodecError> {
        translate_message(&self.data)
    }

    /// Acknowledge the delivery.
    ///
    /// Only deliveries consumed with manual acknowledgement can be settled, exactly once.
    /// Deliveries pulled by a [`RequestDispatcher`](crate::rpc::RequestDispatcher) are settled
    /// by the dispatcher.
    pub async fn ack(&self) -> Result<(), anyhow::Error> {
        self.acker.ack().await
    }

    /// Reject the delivery, putting it back in its queue if `requeue` is set.
    pub async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.acker.nack(requeue).await
    }

    pub fn acker(&self) -> Acker {
        self.acker.clone()
    }
}
