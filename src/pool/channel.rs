//! Implements [`Manager`] for the channels of a [`Transport`].
use anyhow::Context;
use deadpool::managed::{self, Manager};
use std::sync::Arc;

use crate::transport::{HealthStatus, Transport, TransportChannel};

/// `ChannelManager` opens channels on a single shared connection.
pub struct ChannelManager<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> ChannelManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

#[async_trait::async_trait]
impl<T: Transport> Manager for ChannelManager<T> {
    type Type = T::Channel;
    type Error = super::Error;

    async fn create(&self) -> Result<T::Channel, super::Error> {
        let channel = self
            .transport
            .create_channel()
            .await
            .context("Failed to create a pooled channel")?;
        Ok(channel)
    }

    async fn recycle(&self, obj: &mut T::Channel) -> managed::RecycleResult<super::Error> {
        match obj.status() {
            HealthStatus::Healthy => Ok(()),
            HealthStatus::Unhealthy => Err(managed::RecycleError::Message(
                "Channel is not in an healthy state".into(),
            )),
        }
    }
}
