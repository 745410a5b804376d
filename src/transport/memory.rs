//! An in-process broker implementing [`Transport`].
//!
//! It follows RabbitMq's routing rules closely enough to exercise pools, consumers, publishers
//! and dispatchers without a running RabbitMq instance:
//!
//! - the default exchange (`""`) routes to the queue named after the routing key;
//! - `direct` and `headers` exchanges route on an exact routing key match, `fanout` exchanges
//!   route to every bound queue and `topic` exchanges support `*` and `#` wildcards;
//! - messages published to a queue without consumers are buffered until a consumer shows up;
//! - competing consumers on the same queue are served round-robin;
//! - un-routable messages are silently dropped;
//! - redeclaring a queue with different arguments fails with `PRECONDITION_FAILED`;
//! - exclusive queues belong to the connection that declared them and are deleted when it
//!   closes, exclusive consumers lock their queue;
//! - failed declarations and consumer registrations close the channel.
//!
//! Durability is recorded but nothing survives the broker. QoS settings are not enforced.
use anyhow::anyhow;
use futures_util::StreamExt;
use lapin::{BasicProperties, ExchangeKind};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    Access, Acker, Acknowledge, ConsumeOptions, Delivery, DeliveryStream, Durability,
    HealthStatus, QueueOptions, Transport, TransportChannel,
};

/// An in-process message broker.
///
/// Clones share the same broker state: open as many connections as needed with
/// [`InMemoryBroker::connect`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, MemoryExchange>,
    next_delivery_tag: u64,
    acked: usize,
    nacked: usize,
    open_connections: usize,
    max_queues: Option<usize>,
}

#[derive(Default)]
struct MemoryQueue {
    durable: bool,
    exclusive: bool,
    /// The connection owning an exclusive queue.
    owner: Option<u64>,
    messages: VecDeque<Message>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
}

struct MemoryExchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct MemoryConsumer {
    channel_id: u64,
    auto_ack: bool,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Result<Delivery, anyhow::Error>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the broker.
    pub fn connect(&self) -> MemoryConnection {
        self.lock().open_connections += 1;
        MemoryConnection {
            id: CONNECTION_IDS.fetch_add(1, Ordering::SeqCst),
            broker: self.clone(),
            open: Arc::new(AtomicBool::new(true)),
            channels: Arc::new(Mutex::new(Vec::new())),
            channels_created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of deliveries acknowledged so far.
    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    /// Number of deliveries negatively acknowledged so far.
    pub fn nacked(&self) -> usize {
        self.lock().nacked
    }

    /// Number of connections opened and not closed yet.
    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    /// Refuse to declare queues beyond `max_queues`, like a RabbitMq vhost queue limit.
    pub fn set_max_queues(&self, max_queues: usize) {
        self.lock().max_queues = Some(max_queues);
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Is the queue declared as durable? `None` if the queue does not exist.
    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).map(|q| q.durable)
    }

    /// Is the queue declared as exclusive? `None` if the queue does not exist.
    pub fn is_exclusive(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).map(|q| q.exclusive)
    }

    /// Number of messages waiting in `queue` for a consumer.
    pub fn ready_messages(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock cannot leave the state half-updated in a way that
        // matters for an in-process broker.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route(&self, message: Message) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        let queues = if message.exchange.is_empty() {
            vec![message.routing_key.clone()]
        } else {
            let exchange = state.exchanges.get(&message.exchange).ok_or_else(|| {
                anyhow!(
                    "NOT_FOUND - no exchange '{}' in the in-memory broker",
                    message.exchange
                )
            })?;
            exchange
                .bindings
                .iter()
                .filter(|b| routes(&exchange.kind, &b.routing_key, &message.routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };
        for queue in queues {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.messages.push_back(message.clone());
            }
            self.dispatch(&mut state, &queue);
        }
        Ok(())
    }

    /// Hand buffered messages over to the consumers of `queue`, round-robin.
    fn dispatch(&self, state: &mut BrokerState, queue_name: &str) {
        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = state;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        while !queue.consumers.is_empty() {
            let Some(message) = queue.messages.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            let consumer = &queue.consumers[index];
            *next_delivery_tag += 1;
            let acker = if consumer.auto_ack {
                Acker::new(AutoAcked)
            } else {
                Acker::new(MemoryAcker {
                    broker: self.clone(),
                    queue: queue_name.to_owned(),
                    message: message.clone(),
                    settled: AtomicBool::new(false),
                })
            };
            let delivery = Delivery {
                delivery_tag: *next_delivery_tag,
                exchange: message.exchange.as_str().into(),
                routing_key: message.routing_key.as_str().into(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
                acker,
            };
            if consumer.sender.send(Ok(delivery)).is_err() {
                // The consumer went away: drop it and offer the message to someone else.
                queue.consumers.remove(index);
                queue.messages.push_front(message);
                continue;
            }
            queue.next_consumer = index + 1;
        }
    }

    fn cancel_consumers(&self, channel_id: u64) {
        let mut state = self.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }
    }

    /// Delete the exclusive queues of a closed connection, with their bindings.
    fn drop_connection(&self, connection_id: u64) {
        let mut state = self.lock();
        state.open_connections = state.open_connections.saturating_sub(1);
        let BrokerState {
            queues, exchanges, ..
        } = &mut *state;
        queues.retain(|_, q| q.owner != Some(connection_id));
        for exchange in exchanges.values_mut() {
            exchange.bindings.retain(|b| queues.contains_key(&b.queue));
        }
    }
}

impl BrokerState {
    fn declare_queue(
        &mut self,
        name: &str,
        durable: bool,
        exclusive: bool,
        connection_id: u64,
    ) -> Result<(), anyhow::Error> {
        if let Some(existing) = self.queues.get(name) {
            if existing.owner.is_some_and(|owner| owner != connection_id) {
                return Err(anyhow!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}'"
                ));
            }
            if existing.durable != durable {
                return Err(anyhow!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}': \
                     received '{durable}' but current is '{}'",
                    existing.durable
                ));
            }
            if existing.exclusive != exclusive {
                return Err(anyhow!(
                    "PRECONDITION_FAILED - inequivalent arg 'exclusive' for queue '{name}': \
                     received '{exclusive}' but current is '{}'",
                    existing.exclusive
                ));
            }
            return Ok(());
        }
        if let Some(max_queues) = self.max_queues {
            if self.queues.len() >= max_queues {
                return Err(anyhow!(
                    "ACCESS_REFUSED - queue limit in vhost '/' ({max_queues}) is reached"
                ));
            }
        }
        self.queues.insert(
            name.to_owned(),
            MemoryQueue {
                durable,
                exclusive,
                owner: exclusive.then_some(connection_id),
                ..MemoryQueue::default()
            },
        );
        Ok(())
    }

    fn add_consumer(
        &mut self,
        queue: &str,
        consumer: MemoryConsumer,
        connection_id: u64,
    ) -> Result<(), anyhow::Error> {
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| anyhow!("NOT_FOUND - no queue '{queue}'"))?;
        if q.owner.is_some_and(|owner| owner != connection_id) {
            return Err(anyhow!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{queue}'"
            ));
        }
        q.consumers.retain(|c| !c.sender.is_closed());
        if q.consumers.iter().any(|c| c.exclusive) || (consumer.exclusive && !q.consumers.is_empty())
        {
            return Err(anyhow!("ACCESS_REFUSED - queue '{queue}' in exclusive use"));
        }
        q.consumers.push(consumer);
        Ok(())
    }
}

/// `true` if a message published with `routing_key` must be delivered to a queue bound
/// with `binding_key` on an exchange of the given kind.
fn routes(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(
            &binding_key.split('.').collect::<Vec<_>>(),
            &routing_key.split('.').collect::<Vec<_>>(),
        ),
        _ => binding_key == routing_key,
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.split_first(), words.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, words)
                || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some((&"*", rest)), Some((_, remaining))) => topic_matches(rest, remaining),
        (Some((p, rest)), Some((w, remaining))) => p == w && topic_matches(rest, remaining),
        _ => false,
    }
}

/// A connection to an [`InMemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
    open: Arc<AtomicBool>,
    channels: Arc<Mutex<Vec<MemoryChannel>>>,
    channels_created: Arc<AtomicUsize>,
}

impl MemoryConnection {
    /// How many channels have been opened on this connection so far.
    pub fn channels_created(&self) -> usize {
        self.channels_created.load(Ordering::SeqCst)
    }

    /// A handle to the broker this connection is attached to.
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);
static CHANNEL_IDS: AtomicU64 = AtomicU64::new(1);

#[async_trait::async_trait]
impl Transport for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, anyhow::Error> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(anyhow!("the connection is closed"));
        }
        let channel = MemoryChannel {
            id: CHANNEL_IDS.fetch_add(1, Ordering::SeqCst),
            connection_id: self.id,
            broker: self.broker.clone(),
            open: Arc::new(AtomicBool::new(true)),
        };
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(channel.clone());
        self.channels_created.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }

    fn status(&self) -> HealthStatus {
        if self.open.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let channels = std::mem::take(&mut *self.channels.lock().unwrap_or_else(|e| e.into_inner()));
        for channel in channels {
            channel.close();
        }
        self.broker.drop_connection(self.id);
        Ok(())
    }
}

/// A channel opened on a [`MemoryConnection`].
#[derive(Clone)]
pub struct MemoryChannel {
    id: u64,
    connection_id: u64,
    broker: InMemoryBroker,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// A process-wide unique identifier for the channel.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Close the channel, as the broker would after a channel-level error.
    ///
    /// Streams returned by [`TransportChannel::consume`] on this channel end.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.broker.cancel_consumers(self.id);
    }

    /// Channel-level errors close the channel.
    fn fail(&self, error: anyhow::Error) -> anyhow::Error {
        self.close();
        error
    }

    fn ensure_open(&self) -> Result<(), anyhow::Error> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("the channel is closed"))
        }
    }
}

#[async_trait::async_trait]
impl TransportChannel for MemoryChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, anyhow::Error> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_owned()
        };
        let declared = self.broker.lock().declare_queue(
            &name,
            options.durability == Durability::Durable,
            options.access == Access::Exclusive,
            self.connection_id,
        );
        declared.map_err(|e| self.fail(e))?;
        Ok(name)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(anyhow!(
                "ACCESS_REFUSED - the default exchange cannot be redeclared"
            ));
        }
        self.broker
            .lock()
            .exchanges
            .entry(name.to_owned())
            .or_insert_with(|| MemoryExchange {
                kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            return Err(anyhow!("NOT_FOUND - no queue '{queue}'"));
        }
        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| anyhow!("NOT_FOUND - no exchange '{exchange}'"))?;
        let already_bound = exchange
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !already_bound {
            exchange.bindings.push(Binding {
                queue: queue.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }
        Ok(())
    }

    async fn set_qos(&self, _prefetch_count: u16, _prefetch_size: u32) -> Result<(), anyhow::Error> {
        self.ensure_open()
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        payload: &[u8],
    ) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        self.broker.route(Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: payload.to_vec(),
            redelivered: false,
        })
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, anyhow::Error> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let consumer = MemoryConsumer {
            channel_id: self.id,
            auto_ack: options.auto_ack,
            exclusive: options.exclusive,
            sender,
        };
        let registered = {
            let mut state = self.broker.lock();
            let registered = state.add_consumer(queue, consumer, self.connection_id);
            if registered.is_ok() {
                self.broker.dispatch(&mut state, queue);
            }
            registered
        };
        registered.map_err(|e| self.fail(e))?;
        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    fn status(&self) -> HealthStatus {
        if self.open.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

struct AutoAcked;

#[async_trait::async_trait]
impl Acknowledge for AutoAcked {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        Err(anyhow!(
            "PRECONDITION_FAILED - the delivery was automatically acknowledged"
        ))
    }

    async fn nack(&self, _requeue: bool) -> Result<(), anyhow::Error> {
        Err(anyhow!(
            "PRECONDITION_FAILED - the delivery was automatically acknowledged"
        ))
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    message: Message,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<(), anyhow::Error> {
        if self.settled.swap(true, Ordering::SeqCst) {
            Err(anyhow!("PRECONDITION_FAILED - unknown delivery tag"))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.settle()?;
        self.broker.lock().acked += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.settle()?;
        let mut state = self.broker.lock();
        state.nacked += 1;
        if requeue {
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.messages.push_front(Message {
                    redelivered: true,
                    ..self.message.clone()
                });
            }
            self.broker.dispatch(&mut state, &self.queue);
        }
        Ok(())
    }
}
