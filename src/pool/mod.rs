//! A bounded pool of channels multiplexed over one shared connection, built on [`deadpool`].
//!
//! The pool provides two key guarantees:
//! - A channel is lent to one borrower at a time, and never more than `max_size` channels
//!   are open at once.
//! - Broken channels are disposed of when they are returned, and new ones are created on demand.
//!
//! ```rust
//! use carrot_rpc::pool::ChannelPool;
//! use carrot_rpc::transport::{InMemoryBroker, TransportChannel};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let broker = InMemoryBroker::new();
//!     let pool = ChannelPool::new(broker.connect(), 8).await?;
//!
//!     let channel = pool.acquire().await?;
//!     channel.declare_queue("tasks", Default::default()).await?;
//!     pool.release(channel);
//!     Ok(())
//! }
//! ```

mod channel;
mod error;

pub use channel::ChannelManager;
pub use error::Error;

use deadpool::managed::{Object, Pool};
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::transport::{HealthStatus, Transport, TransportChannel};

/// The smallest pool size we accept.
pub const MIN_CHANNELS: usize = 4;
/// The largest pool size we accept.
pub const MAX_CHANNELS: usize = 30;

/// Clamp a requested number of channels (or reply queues) into `[MIN_CHANNELS, MAX_CHANNELS]`.
pub fn clamp_size(requested: usize) -> usize {
    requested.clamp(MIN_CHANNELS, MAX_CHANNELS)
}

/// A snapshot of the pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    /// Channels currently open, idle or lent.
    pub size: usize,
    pub idle: usize,
}

/// A pool of channels opened on one connection owned by the pool.
pub struct ChannelPool<T: Transport> {
    transport: Arc<T>,
    pool: Pool<ChannelManager<T>>,
}

impl<T: Transport> Clone for ChannelPool<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            pool: self.pool.clone(),
        }
    }
}

impl<T: Transport> ChannelPool<T> {
    /// Build a pool over `transport` holding at most `max_channels` channels.
    ///
    /// `max_channels` is clamped into `[4, 30]`.
    /// One channel is opened straight away: if that fails, so does the construction.
    #[tracing::instrument(name = "channel_pool_new", skip(transport))]
    pub async fn new(transport: T, max_channels: usize) -> Result<Self, Error> {
        let transport = Arc::new(transport);
        let max_size = clamp_size(max_channels);
        let pool = Pool::builder(ChannelManager::new(Arc::clone(&transport)))
            .max_size(max_size)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build the channel pool: {}", e))?;
        let pool = Self { transport, pool };
        // Warm up: fail fast if the connection cannot open channels.
        if let Err(e) = pool.acquire().await {
            if let Err(close_error) = pool.close().await {
                warn!("Failed to close the connection of the channel pool: {:?}", close_error);
            }
            return Err(e);
        }
        debug!(max_size, "Channel pool ready");
        Ok(pool)
    }

    /// Check out a channel.
    ///
    /// It returns an idle channel if there is one, it opens a new channel if the pool is not
    /// full yet, otherwise it waits until another borrower releases its channel.
    pub async fn acquire(&self) -> Result<PooledChannel<T>, Error> {
        let object = self.pool.get().await?;
        Ok(PooledChannel(Some(object)))
    }

    /// Give a channel back to the pool.
    ///
    /// Dropping a [`PooledChannel`] has the same effect.
    pub fn release(&self, channel: PooledChannel<T>) {
        drop(channel);
    }

    /// Run `f` with a channel checked out for the duration of the call.
    ///
    /// The channel goes back to the pool when `f` is done with it, on every exit path.
    pub async fn with_channel<F, Fut, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(PooledChannel<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let channel = self.acquire().await?;
        Ok(f(channel).await)
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            idle: status.available.max(0) as usize,
        }
    }

    pub fn max_size(&self) -> usize {
        self.pool.status().max_size
    }

    /// Stop lending channels and close the connection.
    ///
    /// Borrowers waiting in [`ChannelPool::acquire`] get an error.
    pub async fn close(&self) -> Result<(), Error> {
        self.pool.close();
        self.transport.close().await?;
        Ok(())
    }

    /// The connection the channels are opened on.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// A channel checked out of a [`ChannelPool`].
///
/// It goes back to the pool when dropped. A channel that went unhealthy is discarded instead,
/// freeing a slot for a replacement.
pub struct PooledChannel<T: Transport>(Option<Object<ChannelManager<T>>>);

impl<T: Transport> Deref for PooledChannel<T> {
    type Target = T::Channel;

    fn deref(&self) -> &T::Channel {
        // Only emptied in `drop`.
        self.0.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Transport> Drop for PooledChannel<T> {
    fn drop(&mut self) {
        if let Some(object) = self.0.take() {
            if object.status() == HealthStatus::Unhealthy {
                debug!("Discarding an unhealthy channel");
                drop(Object::take(object));
            }
        }
    }
}
