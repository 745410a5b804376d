//! `carrot-rpc` turns a RabbitMq connection into a request/response facility, built on top of
//! [`lapin`].
//!
//! - [`Publisher`](crate::publishers::Publisher) publishes through a bounded pool of channels:
//!   fire-and-forget messages, work queue tasks and RPC requests;
//! - [`Consumer`](crate::consumers::Consumer) consumes work queues and exchange subscriptions
//!   on a dedicated channel, and reserves the exclusive queues RPC replies come back on;
//! - [`RequestDispatcher`](crate::rpc::RequestDispatcher) answers each request with exactly one
//!   reply, under a deadline and with panics contained.
//!
//! [`RpcServer`](crate::rpc::RpcServer) and [`RpcClient`](crate::rpc::RpcClient) are the best
//! starting points.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action against a local RabbitMq.
//!
//! [`lapin`]: https://docs.rs/crate/lapin

pub mod amqp;
pub mod codec;
pub mod consumers;
pub mod meta;
pub mod pool;
pub mod primitives;
pub mod publishers;
pub mod rpc;
pub mod transport;

pub use meta::{DeliveryMode, Meta};
