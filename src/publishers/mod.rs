//! Facilities to publish messages to RabbitMq. Check out [`Publisher`] as a starting point.
mod publisher;

pub use publisher::{PendingReply, Publisher, PublisherBuilder, PublisherError};
