//! Facilities to consume messages from RabbitMq queues. Check out [`Consumer`] as a starting point.
mod consumer;
mod error;
mod reply_queue;

pub use consumer::Consumer;
pub use error::ConsumerError;
pub use reply_queue::ReplyQueueLease;
