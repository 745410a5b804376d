use futures_util::{stream::FuturesUnordered, Future, FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use shutdown_handler::ShutdownHandler;
use tracing::{debug, error, warn};

use crate::codec::{data_envelope, error_envelope, INTERNAL_ERROR_BODY};
use crate::meta::Meta;
use crate::publishers::Publisher;
use crate::rpc::panics::catch_panic;
use crate::rpc::{Handler, HandlerError, Incoming};
use crate::transport::{Delivery, DeliveryStream, Transport};

/// How long a handler may take to answer a request, unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Pulls requests from a delivery stream and answers each of them with exactly one reply.
///
/// Every delivery is processed in its own task:
/// - the reply meta is stamped with the correlation id of the request and routed to its
///   `reply_to` address, if it has one;
/// - the handler runs under a deadline: if it does not complete in time it is dropped and a
///   `request canceled` error is sent instead;
/// - a panicking handler is contained, the constant internal error body is sent instead;
/// - on work queues (see [`RequestDispatcher::acknowledge`]) the delivery is acked once the reply
///   has been sent. If sending the reply failed the delivery is requeued once: a redelivered
///   request that cannot be answered either is dropped.
///
/// The loop does not wait for handlers: back-pressure comes from the prefetch limit of the
/// channel the deliveries are consumed on.
///
/// Build one with [`Publisher::wrap_handler`].
pub struct RequestDispatcher<T: Transport, C, H> {
    publisher: Publisher<T>,
    meta: Meta,
    deliveries: DeliveryStream,
    handler: Arc<H>,
    context: Arc<C>,
    request_timeout: Duration,
    acknowledge: bool,
    /// The number of deliveries processed before leaving the loop.
    /// Deliveries are processed indefinitely if set to `None`.
    exit_after: Option<usize>,
}

impl<T, C, H> RequestDispatcher<T, C, H>
where
    T: Transport,
    C: Send + Sync + 'static,
    H: Handler<C>,
{
    pub(crate) fn new(
        publisher: Publisher<T>,
        meta: Meta,
        deliveries: DeliveryStream,
        handler: H,
        context: Arc<C>,
    ) -> Self {
        Self {
            publisher,
            meta,
            deliveries,
            handler: Arc::new(handler),
            context,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            acknowledge: false,
            exit_after: None,
        }
    }

    /// How long a handler may run before the request is canceled.
    /// Defaults to 5 seconds if left unspecified.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Settle every delivery with the broker once its reply has been sent.
    ///
    /// Required when the deliveries come from a queue consumed with manual acknowledgement,
    /// e.g. [`Consumer::work_on_task`](crate::consumers::Consumer::work_on_task).
    #[must_use]
    pub fn acknowledge(mut self, acknowledge: bool) -> Self {
        self.acknowledge = acknowledge;
        self
    }

    /// Stop pulling deliveries after `n` of them, then wait for their replies.
    #[must_use]
    pub fn exit_after(mut self, n: usize) -> Self {
        self.exit_after = Some(n);
        self
    }

    /// Answer requests until the application receives SIGTERM or the delivery stream ends.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        let shutdown = ShutdownHandler::sigterm()?;
        self.run_until_shutdown(shutdown.wait_for_signal()).await
    }

    /// Answer requests until `shutdown` resolves or the delivery stream ends.
    ///
    /// Pass [`ShutdownHandler::wait_for_signal`] to share a shutdown handler with the rest of
    /// the application.
    ///
    /// On shutdown the dispatcher stops pulling new deliveries; replies in flight are
    /// still sent.
    #[tracing::instrument(skip_all, name = "dispatcher_run", fields(exchange = %self.meta.exchange, key = %self.meta.key))]
    pub async fn run_until_shutdown(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error> {
        let mut task_handles = FuturesUnordered::new();
        let mut counter = 0;

        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        let result = 'event_loop: loop {
            if self.exit_after == Some(counter) {
                break 'event_loop Ok(());
            }

            tokio::select! {
                // shutdowns take precedence over new deliveries
                biased;

                _ = &mut shutdown => {
                    tracing::info!("dispatcher received shutdown event");
                    break 'event_loop Ok(());
                }

                _ = task_handles.next(), if !task_handles.is_empty() => {}

                event = self.deliveries.next() => {
                    match event {
                        None => break 'event_loop Ok(()),
                        Some(Err(e)) => {
                            error!("Delivery stream error: {:?}", e);
                            break 'event_loop Err(e);
                        }
                        Some(Ok(delivery)) => {
                            // One task per delivery: a slow or panicking handler cannot stall
                            // the loop nor tear it down.
                            let handle = tokio::spawn(process(
                                delivery,
                                self.meta.clone(),
                                self.publisher.clone(),
                                Arc::clone(&self.handler),
                                Arc::clone(&self.context),
                                self.request_timeout,
                                self.acknowledge,
                            ));
                            if self.exit_after.is_some() {
                                task_handles.push(handle);
                            }
                            counter += 1;
                        }
                    }
                }
            }
        };

        // Make sure all tasks in flight complete before returning.
        while task_handles.next().await.is_some() {}

        result
    }
}

/// Answer a single request.
#[tracing::instrument(
    name = "process_request",
    skip_all,
    fields(correlation_id = ?delivery.correlation_id(), delivery_tag = delivery.delivery_tag),
    level = tracing::Level::DEBUG
)]
async fn process<T, C, H>(
    delivery: Delivery,
    mut meta: Meta,
    publisher: Publisher<T>,
    handler: Arc<H>,
    context: Arc<C>,
    request_timeout: Duration,
    acknowledge: bool,
) where
    T: Transport,
    C: Send + Sync + 'static,
    H: Handler<C>,
{
    meta.stamp_reply(delivery.correlation_id(), delivery.reply_to());
    let acker = delivery.acker();
    let redelivered = delivery.redelivered;
    let incoming = Incoming {
        context,
        message: delivery,
        meta: meta.clone(),
    };

    let outcome = catch_panic(tokio::time::timeout(
        request_timeout,
        handler.handle(incoming),
    ))
    .await;

    let body = match outcome {
        Ok(Ok(Ok(data))) => data_envelope(&data),
        Ok(Ok(Err(e))) => {
            debug!(error = %e, status_code = e.status_code(), "Handler failed");
            error_envelope(&e)
        }
        Ok(Err(_elapsed)) => {
            warn!(timeout = ?request_timeout, "Handler timed out, canceling the request");
            error_envelope(&HandlerError::request_canceled())
        }
        Err(panic) => {
            match panic.backtrace() {
                Some(backtrace) => error!("Handler panicked: {}\n{}", panic.message(), backtrace),
                None => error!("Handler panicked: {}", panic.message()),
            }
            Ok(INTERNAL_ERROR_BODY.to_vec())
        }
    };
    let body = body.unwrap_or_else(|e| {
        error!("Failed to encode the reply: {:?}", e);
        INTERNAL_ERROR_BODY.to_vec()
    });

    let replied = publisher.produce(&meta, &body).await;
    if !acknowledge {
        return;
    }
    let settled = match replied {
        Ok(()) => acker.ack().await,
        Err(e) if !redelivered => {
            error!("Failed to reply, the request goes back to the queue: {:?}", e);
            acker.nack(true).await
        }
        Err(e) => {
            error!("Failed to reply to a redelivered request, dropping it: {:?}", e);
            acker.nack(false).await
        }
    };
    if let Err(e) = settled {
        warn!("Failed to settle the delivery: {:?}", e);
    }
}
