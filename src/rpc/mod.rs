//! Request/response over RabbitMq.
//!
//! - [`RequestDispatcher`] answers the requests pulled from a delivery stream with a
//!   [`Handler`], under a deadline and with panics contained;
//! - [`RpcServer`] wires consumers, publishers and dispatchers together for the usual
//!   topologies (work queue or exchange subscription);
//! - [`RpcClient`] sends a request and waits for the matching reply.
mod client;
mod dispatcher;
mod error;
mod handler;
mod panics;
mod server;

pub use client::{RpcCallError, RpcClient};
pub use dispatcher::{RequestDispatcher, DEFAULT_REQUEST_TIMEOUT};
pub use error::{ErrorKind, HandlerError, ReasonType};
pub use handler::{ClosureHandler, Handler, Incoming};
pub use server::RpcServer;
