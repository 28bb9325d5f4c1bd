//! # In-Memory AMQP Broker
//!
//! Process-local implementation of the AMQP seam for tests and local
//! development. Exchanges route by exact routing key (or `#`) to bound
//! queues; the first waiting consumer takes the next delivery and unacknowledged deliveries return
//! to their queue when the consumer's channel or the connection goes away.
//!
//! ## Fault injection
//!
//! - [`InMemoryAmqp::sever`] drops every live connection (streams end, the
//!   connection watcher sees the loss)
//! - [`InMemoryAmqp::set_reachable`] makes dials fail until restored
//! - [`InMemoryAmqp::fail_next_consumes`] makes consumer setup fail
//! - [`InMemoryAmqp::close_publisher_channels`] closes the publishing channel
//!   of every live session; publishes fail until the channel is reopened

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::debug;

use crate::messaging::errors::{BrokerError, BrokerResult};
use crate::messaging::providers::amqp::{
    AmqpConnector, AmqpConsumer, AmqpDelivery, AmqpEndpoint, AmqpSession, ConsumeSpec,
    Publishing,
};
use crate::messaging::publication::Acknowledger;
use crate::messaging::subscriber::ConsumerCloser;
use crate::resilience::TransportLink;

/// A settlement observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementRecord {
    Ack { delivery_tag: u64, body: Vec<u8> },
    Nack {
        delivery_tag: u64,
        requeue: bool,
        body: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
struct StoredDelivery {
    routing_key: String,
    publishing: Publishing,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    delivery: StoredDelivery,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<StoredDelivery>,
    consumers: Vec<String>,
    durable: bool,
}

#[derive(Debug, Default)]
struct Topology {
    queues: HashMap<String, QueueState>,
    /// (exchange, routing key, queue)
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
}

impl Topology {
    fn requeue_where<F: Fn(&Unacked) -> bool>(&mut self, predicate: F) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(tag, _)| *tag)
            .collect();
        // Put the oldest back at the front last so order is kept
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                let mut delivery = entry.delivery;
                delivery.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    queue.pending.push_front(delivery);
                }
            }
        }
    }
}

struct AmqpState {
    topology: Mutex<Topology>,
    wake: Notify,
    generation: watch::Sender<u64>,
    reachable: AtomicBool,
    consume_failures: AtomicUsize,
    /// Bumped on every publisher channel close
    channel_closes: AtomicU64,
    dials: AtomicUsize,
    next_tag: AtomicU64,
    published: Mutex<Vec<(String, String, Publishing)>>,
    settlements: Mutex<Vec<SettlementRecord>>,
}

impl AmqpState {
    fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Next delivery for `consumer_tag` on `queue`
    fn take_next(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Option<(u64, StoredDelivery)> {
        let mut topology = self.topology.lock();
        let state = topology.queues.get_mut(queue)?;
        if !state.consumers.iter().any(|tag| tag == consumer_tag) {
            return None;
        }
        let delivery = state.pending.pop_front()?;

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        if !no_ack {
            topology.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    consumer_tag: consumer_tag.to_string(),
                    delivery: delivery.clone(),
                },
            );
        }
        Some((tag, delivery))
    }

    /// Queue a copy for every queue bound to `routing_key` on `exchange`
    fn route(&self, exchange: &str, routing_key: &str, publishing: Publishing) {
        {
            let mut topology = self.topology.lock();
            let targets: Vec<String> = topology
                .bindings
                .iter()
                .filter(|(ex, key, _)| ex == exchange && (key == routing_key || key == "#"))
                .map(|(_, _, queue)| queue.clone())
                .collect();
            for queue in targets {
                if let Some(state) = topology.queues.get_mut(&queue) {
                    state.pending.push_back(StoredDelivery {
                        routing_key: routing_key.to_string(),
                        publishing: publishing.clone(),
                        redelivered: false,
                    });
                }
            }
        }
        self.published.lock().push((
            exchange.to_string(),
            routing_key.to_string(),
            publishing,
        ));
        self.wake.notify_waiters();
    }

    fn remove_consumer(&self, queue: &str, consumer_tag: &str) {
        let mut topology = self.topology.lock();
        if let Some(state) = topology.queues.get_mut(queue) {
            state.consumers.retain(|tag| tag != consumer_tag);
        }
        topology.requeue_where(|entry| entry.consumer_tag == consumer_tag);
        drop(topology);
        self.wake.notify_waiters();
    }
}

/// In-memory AMQP broker; clones share the same broker
#[derive(Clone)]
pub struct InMemoryAmqp {
    state: Arc<AmqpState>,
}

impl Default for InMemoryAmqp {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryAmqp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAmqp")
            .field("generation", &self.state.generation())
            .field("reachable", &self.state.reachable.load(Ordering::SeqCst))
            .field("dials", &self.state.dials.load(Ordering::SeqCst))
            .finish()
    }
}

impl InMemoryAmqp {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Arc::new(AmqpState {
                topology: Mutex::new(Topology::default()),
                wake: Notify::new(),
                generation,
                reachable: AtomicBool::new(true),
                consume_failures: AtomicUsize::new(0),
                channel_closes: AtomicU64::new(0),
                dials: AtomicUsize::new(0),
                next_tag: AtomicU64::new(1),
                published: Mutex::new(Vec::new()),
                settlements: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Drop every live connection; unacked deliveries return to their queues
    pub fn sever(&self) {
        self.state.topology.lock().requeue_where(|_| true);
        self.state.generation.send_modify(|generation| *generation += 1);
        self.state.wake.notify_waiters();
        debug!("In-memory AMQP connections severed");
    }

    /// Make dials fail (false) or succeed again (true)
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `count` consumer setups
    pub fn fail_next_consumes(&self, count: usize) {
        self.state.consume_failures.store(count, Ordering::SeqCst);
    }

    /// Close the publishing channel of every live session, as a
    /// channel-level error would
    pub fn close_publisher_channels(&self) {
        self.state.channel_closes.fetch_add(1, Ordering::SeqCst);
    }

    /// Route a raw body as if another client had published it
    pub fn inject(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) {
        self.state.route(
            exchange,
            routing_key,
            Publishing {
                body: body.into(),
                ..Default::default()
            },
        );
    }

    /// Dial attempts so far, successful or not
    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// Every publish seen: (exchange, routing key, publishing)
    pub fn published(&self) -> Vec<(String, String, Publishing)> {
        self.state.published.lock().clone()
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.state.settlements.lock().clone()
    }

    /// Bodies acknowledged so far
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.settlements()
            .into_iter()
            .filter_map(|record| match record {
                SettlementRecord::Ack { body, .. } => Some(body),
                SettlementRecord::Nack { .. } => None,
            })
            .collect()
    }

    /// (body, requeue) of every nack so far
    pub fn nacked(&self) -> Vec<(Vec<u8>, bool)> {
        self.settlements()
            .into_iter()
            .filter_map(|record| match record {
                SettlementRecord::Nack { body, requeue, .. } => Some((body, requeue)),
                SettlementRecord::Ack { .. } => None,
            })
            .collect()
    }

    /// Deliveries waiting in `queue`
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .topology
            .lock()
            .queues
            .get(queue)
            .map_or(0, |state| state.pending.len())
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked_count(&self) -> usize {
        self.state.topology.lock().unacked.len()
    }

    /// Whether `queue` was declared durable
    pub fn is_durable(&self, queue: &str) -> bool {
        self.state
            .topology
            .lock()
            .queues
            .get(queue)
            .is_some_and(|state| state.durable)
    }
}

#[async_trait]
impl AmqpConnector for InMemoryAmqp {
    async fn connect(&self, endpoint: &AmqpEndpoint) -> BrokerResult<Arc<dyn AmqpSession>> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::connection(format!(
                "dial {}: connection refused",
                endpoint.url
            )));
        }
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(InMemorySession {
            state: Arc::clone(&self.state),
            generation: self.state.generation(),
            publisher_opened: AtomicU64::new(self.state.channel_closes.load(Ordering::SeqCst)),
            closed,
        }))
    }
}

struct InMemorySession {
    state: Arc<AmqpState>,
    generation: u64,
    /// Value of `channel_closes` when the publishing channel was opened
    publisher_opened: AtomicU64,
    closed: watch::Sender<bool>,
}

impl InMemorySession {
    fn is_alive(&self) -> bool {
        !*self.closed.borrow() && self.state.generation() == self.generation
    }

    fn publisher_open(&self) -> bool {
        self.publisher_opened.load(Ordering::SeqCst) == self.state.channel_closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportLink for InMemorySession {
    async fn closed(&self) -> String {
        let mut generation = self.state.generation.subscribe();
        let mine = self.generation;
        let _ = generation.wait_for(|current| *current != mine).await;
        "connection severed by broker".to_string()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.send_replace(true);
        self.state.wake.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl AmqpSession for InMemorySession {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> BrokerResult<()> {
        if !self.is_alive() {
            return Err(BrokerError::publish(routing_key, "connection closed"));
        }
        if !self.publisher_open() {
            return Err(BrokerError::publish(routing_key, "channel closed"));
        }

        self.state.route(exchange, routing_key, publishing);
        Ok(())
    }

    async fn reopen_publisher(&self) -> BrokerResult<()> {
        if !self.is_alive() {
            return Err(BrokerError::connection("connection closed"));
        }
        self.publisher_opened
            .store(self.state.channel_closes.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, spec: &ConsumeSpec) -> BrokerResult<AmqpConsumer> {
        if !self.is_alive() {
            return Err(BrokerError::consume_setup(&spec.routing_key, "connection closed"));
        }
        let remaining = self.state.consume_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.consume_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::consume_setup(&spec.routing_key, "channel open refused"));
        }

        let queue = if spec.queue.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4())
        } else {
            spec.queue.clone()
        };

        {
            let mut topology = self.state.topology.lock();
            let state = topology.queues.entry(queue.clone()).or_default();
            state.durable = spec.durable_queue;
            state.consumers.push(spec.consumer_tag.clone());
            let binding = (spec.exchange.clone(), spec.routing_key.clone(), queue.clone());
            if !topology.bindings.contains(&binding) {
                topology.bindings.push(binding);
            }
        }

        let (channel_closed, _) = watch::channel(false);
        let channel_closed = Arc::new(channel_closed);
        let cursor = Cursor {
            state: Arc::clone(&self.state),
            queue: queue.clone(),
            consumer_tag: spec.consumer_tag.clone(),
            no_ack: spec.no_ack,
            generation: self.generation,
            session_closed: self.closed.subscribe(),
            channel_closed: channel_closed.subscribe(),
        };

        let deliveries = futures::stream::unfold(cursor, |cursor| async move {
            let delivery = cursor.next().await?;
            Some((delivery, cursor))
        })
        .boxed();

        Ok(AmqpConsumer {
            deliveries,
            channel: Arc::new(InMemoryChannel {
                state: Arc::clone(&self.state),
                queue,
                consumer_tag: spec.consumer_tag.clone(),
                closed: channel_closed,
            }),
        })
    }
}

struct Cursor {
    state: Arc<AmqpState>,
    queue: String,
    consumer_tag: String,
    no_ack: bool,
    generation: u64,
    session_closed: watch::Receiver<bool>,
    channel_closed: watch::Receiver<bool>,
}

impl Cursor {
    fn is_open(&self) -> bool {
        !*self.session_closed.borrow()
            && !*self.channel_closed.borrow()
            && self.state.generation() == self.generation
    }

    async fn next(&self) -> Option<AmqpDelivery> {
        loop {
            let notified = self.state.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_open() {
                return None;
            }
            if let Some((delivery_tag, stored)) =
                self.state.take_next(&self.queue, &self.consumer_tag, self.no_ack)
            {
                return Some(self.delivery(delivery_tag, stored));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            }
        }
    }

    fn delivery(&self, delivery_tag: u64, stored: StoredDelivery) -> AmqpDelivery {
        let headers = stored
            .publishing
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        AmqpDelivery {
            routing_key: stored.routing_key,
            headers,
            body: stored.publishing.body.clone(),
            delivery_tag,
            redelivered: stored.redelivered,
            acker: Arc::new(InMemoryAcker {
                state: Arc::clone(&self.state),
                delivery_tag,
                tracked: !self.no_ack,
                body: stored.publishing.body,
            }),
        }
    }
}

struct InMemoryAcker {
    state: Arc<AmqpState>,
    delivery_tag: u64,
    /// False for auto-ack deliveries, which the broker never tracks
    tracked: bool,
    body: Vec<u8>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        let known = self.state.topology.lock().unacked.remove(&self.delivery_tag).is_some();
        if self.tracked && !known {
            return Err(BrokerError::ack(format!(
                "unknown delivery tag {}: channel closed",
                self.delivery_tag
            )));
        }
        self.state.settlements.lock().push(SettlementRecord::Ack {
            delivery_tag: self.delivery_tag,
            body: self.body.clone(),
        });
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        {
            let mut topology = self.state.topology.lock();
            match topology.unacked.remove(&self.delivery_tag) {
                Some(entry) if requeue => {
                    let mut delivery = entry.delivery;
                    delivery.redelivered = true;
                    if let Some(queue) = topology.queues.get_mut(&entry.queue) {
                        queue.pending.push_back(delivery);
                    }
                }
                Some(_) => {}
                None if self.tracked => {
                    return Err(BrokerError::nack(
                        requeue,
                        format!("unknown delivery tag {}: channel closed", self.delivery_tag),
                    ));
                }
                None => {}
            }
        }
        self.state.settlements.lock().push(SettlementRecord::Nack {
            delivery_tag: self.delivery_tag,
            requeue,
            body: self.body.clone(),
        });
        self.state.wake.notify_waiters();
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "rabbitmq"
    }
}

struct InMemoryChannel {
    state: Arc<AmqpState>,
    queue: String,
    consumer_tag: String,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl ConsumerCloser for InMemoryChannel {
    async fn close(&self) -> BrokerResult<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.state.remove_consumer(&self.queue, &self.consumer_tag);
        Ok(())
    }
}
