use crate::helpers::{assert_no_delivery, decode_envelope, get_peer, next_delivery, queue_name, Peer};
use async_trait::async_trait;
use carrot_rpc::codec::{v1::Bus, ApiError, Envelope, INTERNAL_ERROR_BODY};
use carrot_rpc::meta::Meta;
use carrot_rpc::rpc::{ClosureHandler, Handler, HandlerError, Incoming};
use carrot_rpc::transport::{DeliveryStream, ExchangeKind, InMemoryBroker};
use serde_json::{json, Value};
use shutdown_handler::ShutdownHandler;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pull requests from a fresh work queue. Returns the queue name and the deliveries.
async fn work_queue(server: &Peer) -> (String, DeliveryStream) {
    let queue = queue_name();
    let deliveries = server.consumer.work_on_task(&queue, 10).await.unwrap();
    (queue, deliveries)
}

/// Send a request to `queue` and return the reply.
async fn call(client: &Peer, queue: &str, body: Value) -> carrot_rpc::transport::Delivery {
    let mut lease = client.consumer.get_free_queue().await.unwrap();
    let meta = Meta {
        key: queue.to_owned(),
        queue: lease.name().to_owned(),
        ..Meta::default()
    };
    let body = serde_json::to_vec(&body).unwrap();
    let pending = client.publisher.call_rpc(&meta, &body).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(2),
        lease.next_reply(&pending.correlation_id),
    )
    .await
    .expect("Timed out waiting for a reply")
    .unwrap()
}

struct Echo;

#[async_trait]
impl Handler<()> for Echo {
    type Output = Value;

    async fn handle(&self, incoming: Incoming<()>) -> Result<Value, HandlerError> {
        Ok(incoming.message.translate()?)
    }
}

#[tokio::test]
async fn successful_requests_are_answered_with_data_and_acked() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (server, client) = (get_peer(&broker).await, get_peer(&broker).await);
    let (queue, deliveries) = work_queue(&server).await;
    let dispatcher = server
        .publisher
        .wrap_handler(Meta::queue(&queue), deliveries, Echo, ())
        .acknowledge(true)
        .exit_after(1);

    // Act
    let handle = tokio::spawn(dispatcher.run_until_sigterm());
    let reply = call(&client, &queue, json!({"num": "12", "city": "Minsk"})).await;
    handle.await.unwrap().unwrap();

    // Assert
    let envelope: Envelope<Value> = decode_envelope(&reply);
    assert_eq!(envelope, Envelope::Data(json!({"num": "12", "city": "Minsk"})));
    assert_eq!(broker.acked(), 1);
    assert_eq!(broker.nacked(), 0);
}

#[tokio::test]
async fn handler_errors_are_answered_with_an_error_envelope() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (server, client) = (get_peer(&broker).await, get_peer(&broker).await);
    let (queue, deliveries) = work_queue(&server).await;
    let handler = ClosureHandler(|_: Incoming<()>| async {
        Err::<(), _>(HandlerError::not_found("bus not found").with_message("no bus 77 in Minsk"))
    });
    let dispatcher = server
        .publisher
        .wrap_handler(Meta::queue(&queue), deliveries, handler, ())
        .acknowledge(true)
        .exit_after(1);

    // Act
    let handle = tokio::spawn(dispatcher.run_until_sigterm());
    let reply = call(&client, &queue, json!({})).await;
    handle.await.unwrap().unwrap();

    // Assert
    let error = decode_envelope::<()>(&reply).into_result().unwrap_err();
    assert_eq!(error.code, 404);
    assert_eq!(error.reason.error, "bus not found");
    assert_eq!(error.reason.message.as_deref(), Some("no bus 77 in Minsk"));
    // Failed requests are answered too: they are acked.
    assert_eq!(broker.acked(), 1);
}

#[tokio::test]
async fn malformed_requests_are_internal_errors() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (server, client) = (get_peer(&broker).await, get_peer(&broker).await);
    let (queue, deliveries) = work_queue(&server).await;
    let handler = ClosureHandler(|incoming: Incoming<()>| async move {
        incoming.message.translate::<Bus>().map_err(HandlerError::from)
    });
    let dispatcher = server
        .publisher
        .wrap_handler(Meta::queue(&queue), deliveries, handler, ())
        .exit_after(1);

    // Act
    let handle = tokio::spawn(dispatcher.run_until_sigterm());
    let reply = call(&client, &queue, json!({"num": 12})).await;
    handle.await.unwrap().unwrap();

    // Assert
    let error = decode_envelope::<Bus>(&reply).into_result().unwrap_err();
    assert_eq!(error.code, 500);
}

#[tokio::test]
async fn slow_handlers_are_canceled() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (server, client) = (get_peer(&broker).await, get_peer(&broker).await);
    let (queue, deliveries) = work_queue(&server).await;
    let completed = Arc::new(AtomicBool::new(false));
    let handler = ClosureHandler(|incoming: Incoming<AtomicBool>| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        incoming.context.store(true, Ordering::SeqCst);
        Ok::<_, HandlerError>("too late")
    });
    let dispatcher = server
        .publisher
        .wrap_handler(Meta::queue(&queue), deliveries, handler, Arc::clone(&completed))
        .request_timeout(Duration::from_millis(50))
        .acknowledge(true)
        .exit_after(1);

    // Act
    let handle = tokio::spawn(dispatcher.run_until_sigterm());
    let reply = call(&client, &queue, json!({})).await;
    handle.await.unwrap().unwrap();

    // Assert
    let error = decode_envelope::<String>(&reply).into_result().unwrap_err();
    assert_eq!(error.code, 500);
    assert_eq!(error.reason.error, "request canceled");
    assert!(!completed.load(Ordering::SeqCst));
    assert_eq!(broker.acked(), 1);
}

#[tokio::test]
async fn panics_are_contained() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (server, client) = (get_peer(&broker).await, get_peer(&broker).await);
    let (queue, deliveries) = work_queue(&server).await;
    let handler = ClosureHandler(|incoming: Incoming<()>| async move {
        let request: Value = incoming.message.translate()?;
        if request["explode"] == json!(true) {
            panic!("the handler exploded");
        }
        Ok::<_, HandlerError>(request)
    });
    let dispatcher = server
        .publisher
        .wrap_handler(Meta::queue(&queue), deliveries, handler, ())
        .acknowledge(true)
        .exit_after(2);

    // Act
    let handle = tokio::spawn(dispatcher.run_until_sigterm());
    let panicked = call(&client, &queue, json!({"explode": true})).await;
    let answered = call(&client, &queue, json!({"explode": false})).await;
    handle.await.unwrap().unwrap();

    // Assert
    assert_eq!(panicked.data, INTERNAL_ERROR_BODY);
    assert_eq!(
        decode_envelope::<Value>(&panicked).into_result().unwrap_err(),
        ApiError {
            code: 500,
            reason: carrot_rpc::codec::ApiReason {
                error: "Internal server error".into(),
                message: None,
            },
        }
    );
    assert_eq!(
        decode_envelope::<Value>(&answered),
        Envelope::Data(json!({"explode": false}))
    );
    assert_eq!(broker.acked(), 2);
}

#[tokio::test]
async fn every_request_gets_exactly_one_reply() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (server, client) = (get_peer(&broker).await, get_peer(&broker).await);
    let (queue, deliveries) = work_queue(&server).await;
    let dispatcher = server
        .publisher
        .wrap_handler(Meta::queue(&queue), deliveries, Echo, ())
        .acknowledge(true)
        .exit_after(10);
    let mut lease = client.consumer.get_free_queue().await.unwrap();
    let meta = Meta {
        key: queue.clone(),
        queue: lease.name().to_owned(),
        ..Meta::default()
    };

    // Act
    let handle = tokio::spawn(dispatcher.run_until_sigterm());
    let mut correlation_ids = HashSet::new();
    for i in 0..10 {
        let pending = client
            .publisher
            .call_rpc(&meta, json!(i).to_string().as_bytes())
            .await
            .unwrap();
        correlation_ids.insert(pending.correlation_id);
    }
    handle.await.unwrap().unwrap();

    // Assert
    let mut replied = HashSet::new();
    for _ in 0..10 {
        let reply = next_delivery(lease.deliveries()).await;
        assert!(replied.insert(reply.correlation_id().unwrap().to_owned()));
    }
    assert_eq!(replied, correlation_ids);
    assert_no_delivery(lease.deliveries()).await;
    assert_eq!(broker.acked(), 10);
}

#[tokio::test]
async fn requests_without_reply_address_are_answered_on_the_configured_key() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (server, client) = (get_peer(&broker).await, get_peer(&broker).await);
    let (queue, deliveries) = work_queue(&server).await;
    let replies = Meta::exchange("x_replies", ExchangeKind::Direct, "key_replies");
    let mut reply_stream = client.consumer.subscribe(&replies).await.unwrap();
    let dispatcher = server
        .publisher
        .wrap_handler(replies.clone(), deliveries, Echo, ())
        .acknowledge(true)
        .exit_after(1);

    // Act
    let handle = tokio::spawn(dispatcher.run_until_sigterm());
    client
        .publisher
        .produce(&Meta::queue(&queue).with_correlation_id("abc"), b"\"ping\"")
        .await
        .unwrap();
    handle.await.unwrap().unwrap();

    // Assert
    // `Meta::queue` stamps a reply address: the reply is routed on it, and nothing is bound there.
    assert_no_delivery(&mut reply_stream).await;

    // Without a reply address the configured routing key is used.
    let (queue, deliveries) = work_queue(&server).await;
    let dispatcher = server
        .publisher
        .wrap_handler(replies, deliveries, Echo, ())
        .acknowledge(true)
        .exit_after(1);
    let handle = tokio::spawn(dispatcher.run_until_sigterm());
    let request = Meta {
        key: queue,
        ..Meta::default()
    }
    .with_correlation_id("def");
    client.publisher.produce(&request, b"\"ping\"").await.unwrap();
    handle.await.unwrap().unwrap();

    let reply = next_delivery(&mut reply_stream).await;
    assert_eq!(reply.correlation_id(), Some("def"));
    assert_eq!(decode_envelope::<String>(&reply), Envelope::Data("ping".into()));
}

#[tokio::test]
async fn requests_that_cannot_be_answered_are_retried_once_then_dropped() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (server, client) = (get_peer(&broker).await, get_peer(&broker).await);
    let (queue, deliveries) = work_queue(&server).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler = ClosureHandler(|incoming: Incoming<AtomicUsize>| async move {
        incoming.context.fetch_add(1, Ordering::SeqCst);
        Ok::<_, HandlerError>(())
    });
    let nowhere = Meta::exchange("x_never_declared", ExchangeKind::Direct, "key");
    let dispatcher = server
        .publisher
        .wrap_handler(nowhere, deliveries, handler, Arc::clone(&attempts))
        .acknowledge(true);
    let shutdown = Arc::new(ShutdownHandler::new());

    // Act
    let handle = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { dispatcher.run_until_shutdown(shutdown.wait_for_signal()).await })
    };
    let request = Meta {
        key: queue.clone(),
        ..Meta::default()
    };
    client.publisher.produce(&request, b"{}").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.shutdown();
    handle.await.unwrap().unwrap();

    // Assert
    // The first failure puts the request back in the queue, the redelivery is dropped.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(broker.nacked(), 2);
    assert_eq!(broker.acked(), 0);
    assert_eq!(broker.ready_messages(&queue), 0);
}

#[tokio::test]
async fn the_dispatcher_stops_pulling_on_shutdown() {
    // Arrange
    let broker = InMemoryBroker::new();
    let server = get_peer(&broker).await;
    let (_, deliveries) = work_queue(&server).await;
    let handled = Arc::new(AtomicUsize::new(0));
    let handler = ClosureHandler(|incoming: Incoming<AtomicUsize>| async move {
        incoming.context.fetch_add(1, Ordering::SeqCst);
        Ok::<_, HandlerError>(())
    });
    let dispatcher = server
        .publisher
        .wrap_handler(Meta::default(), deliveries, handler, Arc::clone(&handled));
    let shutdown = Arc::new(ShutdownHandler::new());

    // Act
    let handle = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { dispatcher.run_until_shutdown(shutdown.wait_for_signal()).await })
    };
    shutdown.shutdown();

    // Assert
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}
