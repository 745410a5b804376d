use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::amqp::{BrokerSettings, ConnectionFactory};
use crate::consumers::{Consumer, ConsumerError};
use crate::meta::Meta;
use crate::primitives;
use crate::publishers::Publisher;
use crate::rpc::{Handler, RequestDispatcher, DEFAULT_REQUEST_TIMEOUT};
use crate::transport::{AmqpTransport, Transport};

/// Serves requests: a [`Consumer`] pulls them, a [`Publisher`] sends the replies.
pub struct RpcServer<T: Transport = AmqpTransport> {
    consumer: Arc<Consumer<T>>,
    publisher: Publisher<T>,
    request_timeout: Duration,
}

impl RpcServer<AmqpTransport> {
    /// Open a consumer connection and a publisher connection to RabbitMq.
    pub async fn connect(
        factory: &ConnectionFactory,
        settings: &BrokerSettings,
    ) -> Result<Self, anyhow::Error> {
        let consumer = Consumer::connect(factory, settings).await?;
        let publisher = Publisher::connect(factory, settings).await?;
        Ok(Self::new(consumer, publisher).with_request_timeout(settings.request_timeout()))
    }
}

impl<T: Transport> RpcServer<T> {
    /// If the consumer is already behind an `Arc` pointer, it won't be "double-wrapped".
    pub fn new(consumer: impl Into<Arc<Consumer<T>>>, publisher: Publisher<T>) -> Self {
        Self {
            consumer: consumer.into(),
            publisher,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// How long handlers may take to answer a request.
    /// Defaults to 5 seconds if left unspecified.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn consumer(&self) -> &Consumer<T> {
        &self.consumer
    }

    pub fn publisher(&self) -> &Publisher<T> {
        &self.publisher
    }

    /// Serve the requests sent to the `meta.queue` work queue.
    ///
    /// Workers listening on the same queue compete for requests, each of them holding at most
    /// `meta.prefetch_count` (at least one) requests at once. Requests are acknowledged once
    /// answered.
    ///
    /// Replies go to the `reply_to` address of each request. Requests without one are not
    /// answered: the reply is published with an empty routing key and dropped by the broker.
    #[tracing::instrument(name = "rpc_listen", skip(self, handler, context))]
    pub async fn listen_rpc<C, H>(
        &self,
        meta: Meta,
        handler: H,
        context: impl Into<Arc<C>>,
    ) -> Result<RequestDispatcher<T, C, H>, ConsumerError>
    where
        C: Send + Sync + 'static,
        H: Handler<C>,
    {
        let deliveries = self
            .consumer
            .work_on_task(&meta.queue, meta.prefetch_count.max(1))
            .await?;
        // Replies must neither advertise nor loop back into the request queue.
        let reply_meta = Meta {
            queue: String::new(),
            key: String::new(),
            ..meta
        };
        Ok(self
            .publisher
            .wrap_handler(reply_meta, deliveries, handler, context)
            .request_timeout(self.request_timeout)
            .acknowledge(true))
    }

    /// Serve the requests published on the `accept` exchange, replying on the `transmit`
    /// exchange.
    ///
    /// Replies go to the `reply_to` address of the request when it has one, to `transmit.key`
    /// otherwise.
    #[tracing::instrument(name = "rpc_subscribe", skip(self, handler, context))]
    pub async fn subscribe<C, H>(
        &self,
        accept: &Meta,
        transmit: Meta,
        handler: H,
        context: impl Into<Arc<C>>,
    ) -> Result<RequestDispatcher<T, C, H>, ConsumerError>
    where
        C: Send + Sync + 'static,
        H: Handler<C>,
    {
        if !transmit.exchange.is_empty() {
            primitives::declare_exchange(
                self.consumer.channel(),
                &transmit.exchange,
                transmit.exchange_kind.clone(),
                true,
            )
            .await
            .map_err(ConsumerError::Transport)?;
        }
        let deliveries = self.consumer.subscribe(accept).await?;
        Ok(self
            .publisher
            .wrap_handler(transmit, deliveries, handler, context)
            .request_timeout(self.request_timeout))
    }

    /// Serve detailed-routes RPC calls, see [`Meta::detailed_routes_rpc`].
    pub async fn listen_rpc_for_detailed_routes<C, H>(
        &self,
        handler: H,
        context: impl Into<Arc<C>>,
    ) -> Result<RequestDispatcher<T, C, H>, ConsumerError>
    where
        C: Send + Sync + 'static,
        H: Handler<C>,
    {
        let dispatcher = self
            .listen_rpc(Meta::detailed_routes_rpc(), handler, context)
            .await?;
        info!("Listening RPC for detailed routes");
        Ok(dispatcher)
    }

    /// Serve detailed-routes requests broadcast on [`Meta::detailed_routes_accept`], replying on
    /// [`Meta::detailed_routes_transmit`].
    pub async fn subscribe_for_detailed_routes<C, H>(
        &self,
        handler: H,
        context: impl Into<Arc<C>>,
    ) -> Result<RequestDispatcher<T, C, H>, ConsumerError>
    where
        C: Send + Sync + 'static,
        H: Handler<C>,
    {
        let dispatcher = self
            .subscribe(
                &Meta::detailed_routes_accept(),
                Meta::detailed_routes_transmit(),
                handler,
                context,
            )
            .await?;
        info!("Subscribed for detailed routes");
        Ok(dispatcher)
    }

    /// Close both connections.
    pub async fn close(&self) -> Result<(), anyhow::Error> {
        self.consumer.close().await?;
        self.publisher.close().await?;
        Ok(())
    }
}
