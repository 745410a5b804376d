//! Queue and exchange set-up on a single channel.
//!
//! Thin wrappers over [`TransportChannel`] attaching context to failures. Nothing is retried.
use anyhow::Context;

use crate::meta::Meta;
use crate::transport::{Access, Durability, ExchangeKind, QueueOptions, TransportChannel};

/// Declare a queue and return its name.
///
/// An empty `name` declares an exclusive queue named by the broker.
#[tracing::instrument(name = "declare_queue", skip(channel))]
pub async fn declare_queue<C: TransportChannel + ?Sized>(
    channel: &C,
    name: &str,
    durable: bool,
) -> Result<String, anyhow::Error> {
    let options = QueueOptions {
        durability: if durable {
            Durability::Durable
        } else {
            Durability::Transient
        },
        access: if name.is_empty() {
            Access::Exclusive
        } else {
            Access::Shared
        },
    };
    channel
        .declare_queue(name, options)
        .await
        .with_context(|| format!("Failed to declare queue '{name}'"))
}

/// Declare an exchange. Redeclaring an existing exchange with the same settings is a no-op.
#[tracing::instrument(name = "declare_exchange", skip(channel))]
pub async fn declare_exchange<C: TransportChannel + ?Sized>(
    channel: &C,
    name: &str,
    kind: ExchangeKind,
    durable: bool,
) -> Result<(), anyhow::Error> {
    channel
        .declare_exchange(name, kind, durable)
        .await
        .with_context(|| format!("Failed to declare exchange '{name}'"))
}

/// Bind `meta.queue` to `meta.exchange` with routing key `meta.key`.
#[tracing::instrument(name = "bind_queue", skip(channel))]
pub async fn bind_queue<C: TransportChannel + ?Sized>(
    channel: &C,
    meta: &Meta,
) -> Result<(), anyhow::Error> {
    channel
        .bind_queue(&meta.queue, &meta.exchange, &meta.key)
        .await
        .with_context(|| {
            format!(
                "Failed to bind queue '{}' to exchange '{}'",
                meta.queue, meta.exchange
            )
        })
}

#[tracing::instrument(name = "set_qos", skip(channel))]
pub async fn set_qos<C: TransportChannel + ?Sized>(
    channel: &C,
    prefetch_count: u16,
    prefetch_size: u32,
) -> Result<(), anyhow::Error> {
    channel
        .set_qos(prefetch_count, prefetch_size)
        .await
        .context("Failed to set the channel QoS")
}
