//! Connecting to a RabbitMq broker and tuning the RPC layer built on top of it.

pub mod configuration;
mod factory;
pub use configuration::{BrokerSettings, RabbitMqSettings, RabbitMqTlsSettings};
pub use factory::ConnectionFactory;

pub use lapin::{BasicProperties, ExchangeKind};
