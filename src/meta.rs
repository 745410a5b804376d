//! Routing information attached to the messages we publish.
use lapin::{BasicProperties, ExchangeKind};

use crate::codec::CONTENT_TYPE;

/// AMQP delivery mode of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeliveryMode {
    /// The message lives in memory only.
    #[default]
    Transient = 1,
    /// The message survives a broker restart, as long as its queue is durable.
    Persistent = 2,
}

/// Where a message goes and how it should be stamped.
///
/// A `Meta` is a plain value: the dispatcher works on its own copy for every delivery it
/// replies to, stamping the correlation id and the reply address of that delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    /// The exchange to publish to. Empty for the default exchange.
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    /// The queue replies are expected on, sent as `reply_to`.
    pub queue: String,
    /// The routing key.
    pub key: String,
    pub correlation_id: Option<String>,
    pub delivery_mode: DeliveryMode,
    /// How many unacknowledged deliveries a worker may hold at once.
    pub prefetch_count: u16,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            exchange_kind: ExchangeKind::Direct,
            queue: String::new(),
            key: String::new(),
            correlation_id: None,
            delivery_mode: DeliveryMode::Transient,
            prefetch_count: 0,
        }
    }
}

impl Meta {
    /// Publish to `exchange` of the given kind with routing key `key`.
    pub fn exchange(exchange: impl Into<String>, kind: ExchangeKind, key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind: kind,
            key: key.into(),
            ..Self::default()
        }
    }

    /// Publish straight to `queue` through the default exchange.
    pub fn queue(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            key: queue.clone(),
            queue,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// The AMQP properties of a message published with this meta.
    pub fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(self.delivery_mode as u8);
        if let Some(correlation_id) = &self.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }
        if !self.queue.is_empty() {
            properties = properties.with_reply_to(self.queue.as_str().into());
        }
        properties
    }

    /// Stamp the reply to an inbound request: same correlation id, and routed to the
    /// request's reply address when it has one.
    pub(crate) fn stamp_reply(&mut self, correlation_id: Option<&str>, reply_to: Option<&str>) {
        self.correlation_id = correlation_id.map(ToOwned::to_owned);
        if let Some(reply_to) = reply_to.filter(|r| !r.is_empty()) {
            self.key = reply_to.to_owned();
        }
    }

    /// Where detailed-routes requests are broadcast.
    pub fn detailed_routes_accept() -> Self {
        Self::exchange(
            "x_detailed-routes_accept",
            ExchangeKind::Direct,
            "key_detailed-routes_accept",
        )
    }

    /// Where detailed-routes replies are broadcast.
    pub fn detailed_routes_transmit() -> Self {
        Self::exchange(
            "x_detailed-routes_transmit",
            ExchangeKind::Direct,
            "key_detailed-routes_transmit",
        )
    }

    /// The work queue serving detailed-routes RPC calls.
    pub fn detailed_routes_rpc() -> Self {
        Self::queue("detailed-routes_rpc")
    }
}
