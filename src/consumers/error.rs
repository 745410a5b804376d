/// Error returned by [`Consumer`](super::Consumer) operations.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to open the consumer channel")]
    Channel(#[source] anyhow::Error),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Transport(#[source] anyhow::Error),
    #[error("The reply queue set has been closed")]
    ReplyQueuesClosed,
    #[error("The reply queue stopped delivering messages")]
    ReplyQueueDisconnected,
}
