use crate::helpers::{assert_no_delivery, get_peer, next_delivery, queue_name};
use carrot_rpc::consumers::{Consumer, ConsumerError};
use carrot_rpc::meta::Meta;
use carrot_rpc::transport::{ExchangeKind, InMemoryBroker};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn reply_queues_are_reserved_at_start_up() {
    // Arrange
    let broker = InMemoryBroker::new();

    // Act
    let small = Consumer::new(broker.connect(), 1).await.unwrap();
    let large = Consumer::new(broker.connect(), 64).await.unwrap();

    // Assert
    assert_eq!(small.list_all_queues().len(), 4);
    assert_eq!(large.list_all_queues().len(), 30);
    let names: HashSet<_> = small.list_all_queues().iter().collect();
    assert_eq!(names.len(), 4);
    for name in small.list_all_queues() {
        assert_eq!(broker.is_exclusive(name), Some(true));
        assert_eq!(broker.consumer_count(name), 1);
    }
}

#[tokio::test]
async fn reply_queues_are_lent_to_one_caller_at_a_time() {
    // Arrange
    let consumer = Consumer::new(InMemoryBroker::new().connect(), 4)
        .await
        .unwrap();
    let mut leases = Vec::new();
    for _ in 0..4 {
        leases.push(consumer.get_free_queue().await.unwrap());
    }
    let lent: HashSet<_> = leases.iter().map(|l| l.name().to_owned()).collect();
    assert_eq!(lent.len(), 4);

    // Act
    let blocked = tokio::time::timeout(Duration::from_millis(50), consumer.get_free_queue()).await;
    assert!(blocked.is_err());
    let released = leases.pop().unwrap();
    let released_name = released.name().to_owned();
    released.release();

    // Assert
    let lease = tokio::time::timeout(Duration::from_secs(1), consumer.get_free_queue())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.name(), released_name);
}

#[tokio::test]
async fn next_reply_skips_stale_replies() {
    // Arrange
    let broker = InMemoryBroker::new();
    let peer = get_peer(&broker).await;
    let mut lease = peer.consumer.get_free_queue().await.unwrap();
    let reply_meta = Meta {
        key: lease.name().to_owned(),
        ..Meta::default()
    };

    // Act
    for (correlation_id, body) in [("stale", "late"), ("fresh", "expected")] {
        peer.publisher
            .produce(&reply_meta.clone().with_correlation_id(correlation_id), body.as_bytes())
            .await
            .unwrap();
    }
    let reply = lease.next_reply("fresh").await.unwrap();

    // Assert
    assert_eq!(reply.data, b"expected");
    assert_eq!(reply.correlation_id(), Some("fresh"));
}

#[tokio::test]
async fn work_queues_spread_tasks_across_workers() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    let worker_a = get_peer(&broker).await;
    let worker_b = get_peer(&broker).await;
    let mut tasks_a = worker_a.consumer.work_on_task(&queue, 1).await.unwrap();
    let mut tasks_b = worker_b.consumer.work_on_task(&queue, 1).await.unwrap();
    assert_eq!(broker.is_durable(&queue), Some(true));
    assert_eq!(broker.is_exclusive(&queue), Some(false));

    // Act
    for body in ["first", "second"] {
        worker_a.publisher.new_task(&queue, body.as_bytes()).await.unwrap();
    }

    // Assert
    let first = next_delivery(&mut tasks_a).await;
    let second = next_delivery(&mut tasks_b).await;
    assert_eq!(first.data, b"first");
    assert_eq!(second.data, b"second");
    first.ack().await.unwrap();
    second.ack().await.unwrap();
    assert_eq!(broker.acked(), 2);
    assert_no_delivery(&mut tasks_a).await;
}

#[tokio::test]
async fn unacknowledged_tasks_can_be_requeued() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = queue_name();
    let worker = get_peer(&broker).await;
    let mut tasks = worker.consumer.work_on_task(&queue, 1).await.unwrap();
    worker.publisher.new_task(&queue, b"retry me").await.unwrap();

    // Act
    let delivery = next_delivery(&mut tasks).await;
    delivery.nack(true).await.unwrap();

    // Assert
    let redelivery = next_delivery(&mut tasks).await;
    assert!(redelivery.redelivered);
    assert_eq!(redelivery.data, b"retry me");
}

#[tokio::test]
async fn every_subscriber_gets_its_own_copy() {
    // Arrange
    let broker = InMemoryBroker::new();
    let meta = Meta::exchange("x_departures", ExchangeKind::Direct, "key_departures");
    let subscriber_a = get_peer(&broker).await;
    let subscriber_b = get_peer(&broker).await;
    let mut departures_a = subscriber_a.consumer.subscribe(&meta).await.unwrap();
    let mut departures_b = subscriber_b.consumer.subscribe(&meta).await.unwrap();

    // Act
    subscriber_a.publisher.publish(&meta, b"bus 12").await.unwrap();

    // Assert
    for departures in [&mut departures_a, &mut departures_b] {
        let delivery = next_delivery(departures).await;
        assert_eq!(delivery.data, b"bus 12");
        // Subscriptions are acknowledged on delivery.
        assert!(delivery.ack().await.is_err());
    }
}

#[tokio::test]
async fn subscriptions_only_get_their_routing_key() {
    // Arrange
    let broker = InMemoryBroker::new();
    let peer = get_peer(&broker).await;
    let trams = Meta::exchange("x_vehicles", ExchangeKind::Topic, "vehicles.tram.*");
    let mut deliveries = peer.consumer.subscribe(&trams).await.unwrap();

    // Act
    for key in ["vehicles.bus.12", "vehicles.tram.7"] {
        let meta = Meta::exchange("x_vehicles", ExchangeKind::Topic, key);
        peer.publisher.publish(&meta, key.as_bytes()).await.unwrap();
    }

    // Assert
    assert_eq!(next_delivery(&mut deliveries).await.data, b"vehicles.tram.7");
    assert_no_delivery(&mut deliveries).await;
}

#[tokio::test]
async fn closing_the_consumer_ends_its_streams() {
    // Arrange
    let broker = InMemoryBroker::new();
    let peer = get_peer(&broker).await;
    let mut tasks = peer.consumer.work_on_task(&queue_name(), 1).await.unwrap();
    let mut lease = peer.consumer.get_free_queue().await.unwrap();

    // Act
    peer.consumer.close().await.unwrap();

    // Assert
    assert!(tasks.next().await.is_none());
    assert!(matches!(
        lease.next_reply("anything").await,
        Err(ConsumerError::ReplyQueueDisconnected)
    ));
}

#[tokio::test]
async fn consuming_a_missing_queue_fails() {
    let consumer = Consumer::new(InMemoryBroker::new().connect(), 4)
        .await
        .unwrap();

    let outcome = consumer.consume("does-not-exist", false, false).await;

    assert!(matches!(outcome, Err(ConsumerError::Transport(_))));
}

#[tokio::test]
async fn a_consumer_that_fails_to_start_closes_its_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.set_max_queues(2);

    // Act
    let outcome = Consumer::new(broker.connect(), 4).await;

    // Assert
    assert!(matches!(outcome, Err(ConsumerError::Transport(_))));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn exclusive_consumers_keep_the_queue_to_themselves() {
    // Arrange
    let broker = InMemoryBroker::new();
    let first = get_peer(&broker).await;
    let second = get_peer(&broker).await;
    let queue = queue_name();
    let _tasks = first.consumer.work_on_task(&queue, 1).await.unwrap();

    // Act
    let outcome = second.consumer.consume(&queue, false, true).await;

    // Assert
    assert!(matches!(outcome, Err(ConsumerError::Transport(_))));
    assert_eq!(broker.consumer_count(&queue), 1);
}
