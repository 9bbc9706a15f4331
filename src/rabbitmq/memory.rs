// src/rabbitmq/memory.rs
//! A process-local broker.
//!
//! Implements the collaborator traits with the parts of AMQP 0-9-1 semantics
//! this crate relies on: durable exchanges and queues, direct/topic/fanout
//! routing, per-channel prefetch, manual ack/nack with requeue, consumer
//! cancellation and broker-initiated shutdown. Headers exchanges do not
//! evaluate header arguments; they deliver to every bound queue like fanout. It also records every
//! acknowledgement so tests can assert on the exact decisions a consumer made.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use tracing::debug;

use super::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerEndpoint, ConnectionEvent, ConnectionListener,
    DeliveryStream, Envelope, ExchangeKind, MessageProperties,
};
use super::errors::{MessagingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack { requeue: bool },
}

/// One acknowledgement decision as received by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub channel: u16,
    pub delivery_tag: u64,
    pub outcome: AckOutcome,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct QueueConsumer {
    tag: String,
    channel: u64,
    sender: UnboundedSender<Result<Envelope>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<QueueConsumer>,
    cursor: usize,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: u64,
    number: u16,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

struct ConnectionState {
    open: bool,
    channels: Vec<u64>,
    next_channel_number: u16,
    listeners: Vec<ConnectionListener>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    next_connection_id: u64,
    next_channel_key: u64,
    endpoints: Vec<BrokerEndpoint>,
    acknowledgements: Vec<Acknowledgement>,
    published: usize,
    refuse_connects: usize,
    connect_delay: Duration,
}

/// Topic pattern match: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((key_word, key_rest))) => {
                word == key_word && matches(rest, key_rest)
            }
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

impl BrokerState {
    fn open_channel_mut(&mut self, key: u64) -> Result<&mut ChannelState> {
        let connection_open = self
            .channels
            .get(&key)
            .and_then(|channel| self.connections.get(&channel.connection))
            .map(|connection| connection.open)
            .unwrap_or(false);

        match self.channels.get_mut(&key) {
            Some(channel) if channel.open && connection_open => Ok(channel),
            _ => Err(MessagingError::Transport(format!(
                "channel {} is closed",
                key
            ))),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        // The default exchange routes straight to the queue named by the key.
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let kind = self.exchanges.get(exchange).ok_or_else(|| {
            MessagingError::Transport(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Direct | ExchangeKind::Custom(_) => {
                    binding.routing_key == routing_key
                }
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&idx| {
                    channels
                        .get(&queue.consumers[idx].channel)
                        .map(|ch| {
                            ch.open && (ch.prefetch == 0 || ch.unacked.len() < ch.prefetch as usize)
                        })
                        .unwrap_or(false)
                });

            let Some(idx) = chosen else {
                break;
            };
            let Some(channel) = channels.get_mut(&queue.consumers[idx].channel) else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            queue.cursor = idx + 1;
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let envelope = Envelope {
                delivery_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if queue.consumers[idx].sender.unbounded_send(Ok(envelope)).is_err() {
                // Receiver went away without cancelling.
                channel.next_tag -= 1;
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }

            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    message,
                },
            );
        }
    }

    /// Closes a channel: drops its consumers and returns unacked messages to
    /// the front of their queues in delivery order.
    fn close_channel(&mut self, key: u64) {
        let Some(channel) = self.channels.get_mut(&key) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let unacked = std::mem::take(&mut channel.unacked);

        let mut affected: Vec<String> = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| consumer.channel != key);
            if queue.consumers.len() != before {
                affected.push(name.clone());
            }
        }

        for (_, entry) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            if !affected.contains(&entry.queue) {
                affected.push(entry.queue);
            }
        }

        for queue in affected {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, id: u64) -> Vec<ConnectionListener> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Vec::new();
        };
        connection.open = false;
        let channels = std::mem::take(&mut connection.channels);
        let listeners = connection.listeners.clone();

        for key in channels {
            self.close_channel(key);
        }
        listeners
    }

    fn settle(&mut self, key: u64, delivery_tag: u64, outcome: AckOutcome) -> Result<()> {
        let channel = self.open_channel_mut(key)?;
        let number = channel.number;
        let entry = channel.unacked.remove(&delivery_tag).ok_or_else(|| {
            MessagingError::Transport(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))
        })?;

        self.acknowledgements.push(Acknowledgement {
            channel: number,
            delivery_tag,
            outcome,
            body: entry.message.body.clone(),
        });

        if let AckOutcome::Nack { requeue: true } = outcome {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }

        self.dispatch(&entry.queue);
        Ok(())
    }
}

/// Cheap to clone; clones share the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every connect attempt waits this long before completing.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// The next `count` connect attempts fail with a transport error.
    pub fn refuse_next_connects(&self, count: usize) {
        self.lock().refuse_connects = count;
    }

    /// Simulates the broker closing every open connection.
    pub fn shutdown(&self, reason: &str) {
        let listeners: Vec<ConnectionListener> = {
            let mut state = self.lock();
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, connection)| connection.open)
                .map(|(id, _)| *id)
                .collect();
            open.into_iter()
                .flat_map(|id| state.close_connection(id))
                .collect()
        };

        let event = ConnectionEvent::Shutdown {
            reason: reason.to_string(),
        };
        for listener in listeners {
            listener(event.clone());
        }
    }

    /// Raises a callback fault on every open connection.
    pub fn raise_callback_fault(&self, message: &str) {
        let listeners: Vec<ConnectionListener> = self
            .lock()
            .connections
            .values()
            .filter(|connection| connection.open)
            .flat_map(|connection| connection.listeners.clone())
            .collect();

        let event = ConnectionEvent::CallbackFault {
            message: message.to_string(),
        };
        for listener in listeners {
            listener(event.clone());
        }
    }

    /// Connections successfully opened over the broker's lifetime.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.values().filter(|c| c.open).count()
    }

    /// Channels opened over the broker's lifetime.
    pub fn channels_opened(&self) -> usize {
        self.lock().channels.len()
    }

    /// Endpoints of every connect attempt, successful or not.
    pub fn endpoints(&self) -> Vec<BrokerEndpoint> {
        self.lock().endpoints.clone()
    }

    pub fn acknowledgements(&self) -> Vec<Acknowledgement> {
        self.lock().acknowledgements.clone()
    }

    pub fn published(&self) -> usize {
        self.lock().published
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).cloned()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
    }

    /// Messages waiting in the queue, not counting unacked deliveries.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_connection(
        &self,
        endpoint: &BrokerEndpoint,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let delay = self.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.endpoints.push(endpoint.clone());

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(MessagingError::Transport(format!(
                "connection refused by {}",
                endpoint
            )));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                channels: Vec::new(),
                next_channel_number: 0,
                listeners: Vec::new(),
            },
        );

        debug!(connection = id, %endpoint, "In-memory connection opened");
        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .map(|c| c.open)
            .unwrap_or(false)
    }

    fn subscribe(&self, listener: ConnectionListener) {
        if let Some(connection) = self.broker.lock().connections.get_mut(&self.id) {
            connection.listeners.push(listener);
        }
    }

    fn unsubscribe_all(&self) {
        if let Some(connection) = self.broker.lock().connections.get_mut(&self.id) {
            connection.listeners.clear();
        }
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        let Some(connection) = state.connections.get_mut(&self.id).filter(|c| c.open) else {
            return Err(MessagingError::Transport(format!(
                "connection {} is closed",
                self.id
            )));
        };

        connection.next_channel_number += 1;
        let number = connection.next_channel_number;

        state.next_channel_key += 1;
        let key = state.next_channel_key;
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.channels.push(key);
        }
        state.channels.insert(
            key,
            ChannelState {
                connection: self.id,
                number,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            key,
            number,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        // Listeners are only told about broker-initiated shutdowns.
        self.broker.lock().close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    key: u64,
    number: u16,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        self.broker.lock().open_channel_mut(self.key).is_ok()
    }

    async fn confirm_select(&self) -> Result<()> {
        self.broker.lock().open_channel_mut(self.key)?;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind, _durable: bool) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel_mut(self.key)?;

        match state.exchanges.get(name) {
            Some(existing) if existing != kind => {
                let message = format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    name, kind, existing
                );
                state.close_channel(self.key);
                Err(MessagingError::Transport(message))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel_mut(self.key)?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel_mut(self.key)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::Transport(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Transport(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel_mut(self.key)?;

        let targets = state.route(exchange, routing_key)?;
        state.published += 1;

        if targets.is_empty() {
            debug!(exchange, routing_key, "Message unroutable, dropped");
        }

        for queue_name in targets {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    properties: properties.clone(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
            state.dispatch(&queue_name);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel_mut(self.key)?.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        state.open_channel_mut(self.key)?;

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(MessagingError::Transport(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        };

        let (sender, receiver) = mpsc::unbounded();
        queue_state.consumers.push(QueueConsumer {
            tag: consumer_tag.to_string(),
            channel: self.key,
            sender,
        });
        state.dispatch(queue);

        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.broker
            .lock()
            .settle(self.key, delivery_tag, AckOutcome::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.broker
            .lock()
            .settle(self.key, delivery_tag, AckOutcome::Nack { requeue })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel_mut(self.key)?;

        // Dropping the sender ends the consumer's delivery stream.
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == self.key && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel_mut(self.key)?;
        state.close_channel(self.key);
        Ok(())
    }
}
