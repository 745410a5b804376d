//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use crate::meta::Meta;
use crate::rpc::HandlerError;
use crate::transport::Delivery;

/// Implementers of the `Handler` trait answer the requests pulled by a
/// [`RequestDispatcher`](crate::rpc::RequestDispatcher).
///
/// # Scope
///
/// `handle` does not get access to the underlying channel.
/// The dispatcher encodes the outcome (`{"data": ...}` on success, `{"error": ...}` on failure),
/// sends it to the reply address of the request and settles the delivery with the broker.
///
/// # Implementers
///
/// While you can implement `Handler` for a struct or enum, most of the time you will wrap an
/// async function with a matching signature, `Fn(Incoming<Context>) -> Fut`, in a
/// [`ClosureHandler`].
#[async_trait::async_trait]
pub trait Handler<Context>: Send + Sync + 'static {
    /// The payload of a successful reply.
    type Output: Serialize + Send + 'static;

    async fn handle(&self, incoming: Incoming<Context>) -> Result<Self::Output, HandlerError>;
}

#[async_trait::async_trait]
impl<Context, H> Handler<Context> for Box<H>
where
    Context: Send + Sync + 'static,
    H: Handler<Context> + ?Sized,
{
    type Output = H::Output;

    async fn handle(&self, incoming: Incoming<Context>) -> Result<Self::Output, HandlerError> {
        H::handle(self, incoming).await
    }
}

#[async_trait::async_trait]
impl<Context, H> Handler<Context> for Arc<H>
where
    Context: Send + Sync + 'static,
    H: Handler<Context> + ?Sized,
{
    type Output = H::Output;

    async fn handle(&self, incoming: Incoming<Context>) -> Result<Self::Output, HandlerError> {
        H::handle(self, incoming).await
    }
}

/// Turns an async function into a [`Handler`].
///
/// ```rust
/// use carrot_rpc::rpc::{ClosureHandler, HandlerError, Incoming};
/// use carrot_rpc::codec::v1::Bus;
///
/// async fn find_bus(incoming: Incoming<()>) -> Result<Vec<Bus>, HandlerError> {
///     let bus: Bus = incoming.message.translate()?;
///     Ok(vec![bus])
/// }
///
/// let handler = ClosureHandler(find_bus);
/// ```
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<Context, F, Fut, Output, Error> Handler<Context> for ClosureHandler<F>
where
    Context: Send + Sync + 'static,
    F: Fn(Incoming<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Output, Error>> + Send + 'static,
    Output: Serialize + Send + 'static,
    Error: Into<HandlerError> + Send + 'static,
{
    type Output = Output;

    async fn handle(&self, incoming: Incoming<Context>) -> Result<Output, HandlerError> {
        (self.0)(incoming).await.map_err(Into::into)
    }
}

/// A request ready for processing.
pub struct Incoming<C> {
    /// Resources required to process the request that outlive it, e.g. a database pool.
    ///
    /// The context is behind an `Arc` pointer so that requests handled concurrently share it.
    pub context: Arc<C>,
    /// What we received from the broker: properties, payload, delivery tag, etc.
    pub message: Delivery,
    /// Where the reply is going to be sent, already stamped with the request's
    /// correlation id and reply address.
    pub meta: Meta,
}
