//! The same flows against a real broker.
//!
//! Run with `cargo test -- --ignored` once RabbitMq listens on `localhost:5672`
//! (e.g. `docker run -p 5672:5672 rabbitmq:3`).
use crate::helpers::{get_connection_factory, next_delivery, queue_name};
use carrot_rpc::amqp::BrokerSettings;
use carrot_rpc::consumers::Consumer;
use carrot_rpc::meta::Meta;
use carrot_rpc::pool::ChannelPool;
use carrot_rpc::publishers::Publisher;
use carrot_rpc::rpc::{ClosureHandler, HandlerError, Incoming, RpcClient, RpcServer};
use carrot_rpc::transport::{AmqpTransport, HealthStatus, Transport, TransportChannel};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;

#[tokio::test]
#[ignore = "requires a RabbitMq instance on localhost:5672"]
async fn the_pool_reuses_channels_on_a_real_connection() {
    // Arrange
    let transport = AmqpTransport::connect(&get_connection_factory())
        .await
        .unwrap();
    let pool = ChannelPool::new(transport, 4).await.unwrap();

    // Act
    let channel = pool.acquire().await.unwrap();
    assert_eq!(channel.status(), HealthStatus::Healthy);
    pool.release(channel);
    let again = pool.acquire().await.unwrap();

    // Assert
    assert_eq!(pool.status().size, 1);
    assert_eq!(again.status(), HealthStatus::Healthy);
    drop(again);
    pool.close().await.unwrap();
    assert_eq!(pool.transport().status(), HealthStatus::Unhealthy);
}

#[tokio::test]
#[ignore = "requires a RabbitMq instance on localhost:5672"]
async fn tasks_reach_a_worker_through_a_durable_queue() {
    // Arrange
    let factory = get_connection_factory();
    let settings = BrokerSettings::default();
    let worker = Consumer::connect(&factory, &settings).await.unwrap();
    let producer = Publisher::connect(&factory, &settings).await.unwrap();
    let queue = queue_name();

    // Act
    producer.new_task(&queue, b"resize").await.unwrap();
    let mut tasks = worker.work_on_task(&queue, 1).await.unwrap();
    let task = next_delivery(&mut tasks).await;

    // Assert
    assert_eq!(task.data, b"resize");
    assert!(!task.redelivered);
    task.acker().ack().await.unwrap();
    worker.close().await.unwrap();
    producer.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a RabbitMq instance on localhost:5672"]
async fn rpc_round_trip_through_rabbitmq() {
    // Arrange
    let factory = get_connection_factory();
    let settings = BrokerSettings::default();
    let meta = Meta::queue(queue_name());
    let handler = ClosureHandler(|incoming: Incoming<()>| async move {
        let word: String = incoming.message.translate()?;
        Ok::<_, HandlerError>(word.to_uppercase())
    });
    let server = RpcServer::connect(&factory, &settings).await.unwrap();
    let dispatcher = server.listen_rpc(meta.clone(), handler, ()).await.unwrap();
    let shutdown = Arc::new(ShutdownHandler::new());
    let handle = tokio::spawn({
        let shutdown = Arc::clone(&shutdown);
        async move { dispatcher.run_until_shutdown(shutdown.wait_for_signal()).await }
    });
    let client = RpcClient::connect(&factory, &settings).await.unwrap();

    // Act
    let reply: String = client.call(&meta, "tram").await.unwrap();
    shutdown.shutdown();
    handle.await.unwrap().unwrap();

    // Assert
    assert_eq!(reply, "TRAM");
}
