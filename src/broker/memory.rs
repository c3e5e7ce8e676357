// src/broker/memory.rs
//
// In-process topic broker. Behaves like a single RabbitMQ node for the
// subset of AMQP the pipeline uses: durable declarations with equivalence
// checks, topic/direct/fanout routing, prefetch, manual ack with requeue,
// dead-lettering and connection loss.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use super::errors::{BrokerError, Result};
use super::session::{
    AckMode, Acknowledger, Binding, Connector, Delivery, DeliveryMetadata, DeliveryStream,
    ExchangeKind, ExchangeSpec, OutgoingProperties, QueueSpec, Session,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: OutgoingProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    session_id: u64,
    ack_mode: AckMode,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct Unacked {
    message: StoredMessage,
    session_id: u64,
    consumer_tag: String,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
}

/// A message as it was handed to an exchange, kept for inspection.
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub exchange: String,
    pub routing_key: String,
    pub body: Value,
    pub correlation_id: Option<String>,
    pub persistent: bool,
    pub content_type: String,
}

#[derive(Default)]
struct BrokerState {
    reachable: bool,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<Binding>,
    sessions: HashMap<u64, Arc<AtomicBool>>,
    next_session: u64,
    next_tag: u64,
    opened: u64,
    published: Vec<PublishedRecord>,
}

/// Shared handle to one in-memory broker node.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryBroker {
    pub fn new() -> Self {
        let state = BrokerState {
            reachable: true,
            ..BrokerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// Simulates the broker going down (false) or coming back (true).
    /// Going down also severs every open connection.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
        if !reachable {
            self.drop_connections();
        }
    }

    /// Severs every open connection, requeueing their unacked deliveries.
    pub fn drop_connections(&self) {
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            close_session(&mut state, &self.state, id);
        }
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        lock(&self.state).exchanges.get(name).cloned()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings: Vec<Binding> = lock(&self.state).bindings.iter().cloned().collect();
        bindings.sort_by(|a, b| {
            (&a.exchange, &a.queue, &a.routing_key).cmp(&(&b.exchange, &b.queue, &b.routing_key))
        });
        bindings
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(name)
            .map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(name)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.len())
    }

    /// Number of connections ever opened.
    pub fn connections_opened(&self) -> u64 {
        lock(&self.state).opened
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        lock(&self.state).published.clone()
    }

    pub fn published_with_key(&self, routing_key: &str) -> Vec<PublishedRecord> {
        self.published()
            .into_iter()
            .filter(|record| record.routing_key == routing_key)
            .collect()
    }
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _url: &str) -> Result<Box<dyn Session>> {
        let mut state = lock(&self.broker.state);
        if !state.reachable {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        state.next_session += 1;
        state.opened += 1;
        let id = state.next_session;
        let open = Arc::new(AtomicBool::new(true));
        state.sessions.insert(id, open.clone());
        debug!(session = id, "Opened in-memory broker session");
        Ok(Box::new(MemorySession {
            id,
            open,
            state: self.broker.state.clone(),
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    id: u64,
    open: Arc<AtomicBool>,
    state: Arc<Mutex<BrokerState>>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Channel("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared {} (durable={}), existing {} (durable={})",
                spec.name, spec.kind, spec.durable, existing.kind, existing.durable
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                        unacked: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind(&self, binding: &Binding) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::Channel(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::Channel(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &OutgoingProperties,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            properties: properties.clone(),
            redelivered: false,
        };
        route(&mut state, &self.state, message)?;
        state.published.push(PublishedRecord {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: serde_json::from_slice(payload).unwrap_or(Value::Null),
            correlation_id: properties.correlation_id.clone(),
            persistent: properties.persistent,
            content_type: properties.content_type.clone(),
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        let (sender, receiver) = mpsc::unbounded();
        let queue_state = state.queues.get_mut(queue).ok_or_else(|| {
            BrokerError::Consume(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        queue_state.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            session_id: self.id,
            ack_mode,
            prefetch,
            in_flight: 0,
            sender,
        });
        pump(&mut state, &self.state, queue);
        Ok(receiver.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = lock(&self.state);
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        close_session(&mut state, &self.state, self.id);
        Ok(())
    }
}

fn close_session(state: &mut BrokerState, shared: &Arc<Mutex<BrokerState>>, id: u64) {
    if let Some(flag) = state.sessions.remove(&id) {
        flag.store(false, Ordering::SeqCst);
    }
    let names: Vec<String> = state.queues.keys().cloned().collect();
    for name in names {
        if let Some(queue) = state.queues.get_mut(&name) {
            queue.consumers.retain(|c| c.session_id != id);
            let orphaned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.session_id == id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in orphaned {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
        pump(state, shared, &name);
    }
}

fn route(
    state: &mut BrokerState,
    shared: &Arc<Mutex<BrokerState>>,
    message: StoredMessage,
) -> Result<()> {
    let kind = state
        .exchanges
        .get(&message.exchange)
        .map(|e| e.kind.clone())
        .ok_or_else(|| {
            BrokerError::Publish(format!("NOT_FOUND - no exchange '{}'", message.exchange))
        })?;

    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|b| b.exchange == message.exchange)
        .filter(|b| binding_matches(&kind, &b.routing_key, &message.routing_key))
        .map(|b| b.queue.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    if targets.is_empty() {
        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            "Message was unroutable and dropped"
        );
    }

    for name in targets {
        if let Some(queue) = state.queues.get_mut(&name) {
            queue.ready.push_back(message.clone());
        }
        pump(state, shared, &name);
    }
    Ok(())
}

fn binding_matches(kind: &ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct | ExchangeKind::Headers => pattern == routing_key,
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && match_words(rest, key_rest),
            None => false,
        },
    }
}

/// Hands ready messages to consumers that have prefetch room.
fn pump(state: &mut BrokerState, shared: &Arc<Mutex<BrokerState>>, queue_name: &str) {
    loop {
        state.next_tag += 1;
        let tag = state.next_tag;
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        queue.consumers.retain(|c| !c.sender.is_closed());
        if queue.ready.is_empty() || queue.consumers.is_empty() {
            return;
        }

        let count = queue.consumers.len();
        let start = queue.next_consumer % count;
        let Some(index) = (0..count).map(|offset| (start + offset) % count).find(|&i| {
            let consumer = &queue.consumers[i];
            consumer.ack_mode == AckMode::Auto
                || consumer.prefetch == 0
                || consumer.in_flight < usize::from(consumer.prefetch)
        }) else {
            return;
        };
        queue.next_consumer = index + 1;

        let Some(message) = queue.ready.pop_front() else {
            return;
        };
        let consumer = &mut queue.consumers[index];
        let metadata = DeliveryMetadata {
            delivery_tag: tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            message_id: Some(message.properties.message_id.clone()),
            correlation_id: message.properties.correlation_id.clone(),
            content_type: Some(message.properties.content_type.clone()),
        };
        let delivery = Delivery {
            metadata,
            body: message.payload.clone(),
            acker: Box::new(MemoryAcker {
                state: shared.clone(),
                queue: queue_name.to_string(),
                tag,
                manual: consumer.ack_mode == AckMode::Manual,
            }),
        };

        if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
            queue.ready.push_front(message);
            continue;
        }
        if consumer.ack_mode == AckMode::Manual {
            consumer.in_flight += 1;
            let unacked = Unacked {
                message,
                session_id: consumer.session_id,
                consumer_tag: consumer.tag.clone(),
            };
            queue.unacked.insert(tag, unacked);
        }
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
    manual: bool,
}

enum Settle {
    Ack,
    Requeue,
    Discard,
}

impl MemoryAcker {
    fn settle(&self, how: Settle) -> Result<()> {
        if !self.manual {
            return Ok(());
        }
        let mut state = lock(&self.state);
        let queue = state.queues.get_mut(&self.queue).ok_or_else(|| {
            BrokerError::Ack(format!("queue '{}' no longer exists", self.queue))
        })?;
        let unacked = queue.unacked.remove(&self.tag).ok_or_else(|| {
            BrokerError::Ack(format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag))
        })?;
        if let Some(consumer) = queue
            .consumers
            .iter_mut()
            .find(|c| c.tag == unacked.consumer_tag)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        let mut message = unacked.message;
        match how {
            Settle::Ack => {}
            Settle::Requeue => {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Settle::Discard => {
                if let Some(dlx) = queue.spec.dead_letter_exchange.clone() {
                    message.exchange = dlx;
                    message.redelivered = false;
                    if let Err(err) = route(&mut state, &self.state, message) {
                        debug!("Dead-lettering failed: {}", err);
                    }
                }
            }
        }
        pump(&mut state, &self.state, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(if requeue { Settle::Requeue } else { Settle::Discard })
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.nack(requeue).await
    }
}
