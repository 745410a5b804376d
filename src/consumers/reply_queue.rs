use futures_util::StreamExt;
use std::fmt;
use tracing::debug;

use super::ConsumerError;
use crate::transport::{Delivery, DeliveryStream};

/// An exclusive queue reserved at start-up to receive RPC replies, with its delivery stream.
pub(crate) struct ReplyQueue {
    pub(crate) name: String,
    pub(crate) deliveries: DeliveryStream,
}

/// A reply queue lent to a single caller.
///
/// The queue goes back to the set when the lease is dropped (or [`released`](Self::release)).
pub struct ReplyQueueLease(pub(crate) deadpool::unmanaged::Object<ReplyQueue>);

impl ReplyQueueLease {
    /// The name of the queue, to be used as the `reply_to` address of a request.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Everything delivered to the queue. Messages are acknowledged on delivery.
    pub fn deliveries(&mut self) -> &mut DeliveryStream {
        &mut self.0.deliveries
    }

    /// Wait for the reply carrying `correlation_id`.
    ///
    /// Replies to earlier requests (e.g. requests whose caller gave up waiting) are discarded.
    pub async fn next_reply(&mut self, correlation_id: &str) -> Result<Delivery, ConsumerError> {
        loop {
            match self.0.deliveries.next().await {
                None => return Err(ConsumerError::ReplyQueueDisconnected),
                Some(Err(e)) => return Err(ConsumerError::Transport(e)),
                Some(Ok(delivery)) if delivery.correlation_id() == Some(correlation_id) => {
                    return Ok(delivery)
                }
                Some(Ok(delivery)) => {
                    debug!(
                        queue = %self.0.name,
                        stale_correlation_id = ?delivery.correlation_id(),
                        "Discarding a stale reply"
                    );
                }
            }
        }
    }

    /// Give the queue back to the set.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for ReplyQueueLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyQueueLease")
            .field("name", &self.0.name)
            .finish()
    }
}
