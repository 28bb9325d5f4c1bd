//! # In-Memory Long-Poll Service
//!
//! Process-local stand-in for an HTTP long-poll queue service. Each topic
//! keeps an append-only log; every consumer group reads it from the start
//! with its own cursor. A polled message stays invisible until acknowledged
//! or until the invisibility window passes, after which it is handed out again
//! with a fresh receipt.
//!
//! `sever()` kills every client handed out so far, the way a service restart
//! or an expired session would; the broker's watcher then dials a new one.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};

use crate::messaging::errors::{BrokerError, BrokerResult};
use crate::messaging::message::{MessageId, ReceiptHandle};
use crate::messaging::providers::long_poll::{
    AckFailure, AckFailureItem, PollClient, PollConnector, PollEndpoint, PollError, PolledMessage,
    TopicConsumer, TopicProducer,
};
use crate::resilience::TransportLink;

/// Default time a polled, unacknowledged message stays hidden
pub const DEFAULT_INVISIBILITY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Vec<u8>,
    properties: HashMap<String, String>,
    consumed_times: u32,
}

#[derive(Debug)]
struct Inflight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    redeliver: VecDeque<StoredMessage>,
    inflight: HashMap<ReceiptHandle, Inflight>,
    acked: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct TopicLog {
    messages: Vec<StoredMessage>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Topic {
    log: Mutex<TopicLog>,
    arrivals: Notify,
}

#[derive(Debug, Default)]
struct Faults {
    failing_polls: usize,
    stalled_polls: usize,
    failing_acks: usize,
    failing_producers: usize,
    producer_delay: Option<Duration>,
}

struct PollState {
    topics: DashMap<String, Arc<Topic>>,
    producer_creations: DashMap<String, usize>,
    faults: Mutex<Faults>,
    reachable: AtomicBool,
    invisibility: Mutex<Duration>,
    next_id: AtomicU64,
    generation: watch::Sender<u64>,
    dials: AtomicUsize,
}

impl PollState {
    fn topic(&self, name: &str) -> Arc<Topic> {
        Arc::clone(self.topics.entry(name.to_string()).or_default().value())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.borrow() == generation
    }

    /// Resolve once clients of `generation` have been severed
    async fn severed(&self, generation: u64) {
        let mut current = self.generation.subscribe();
        let _ = current.wait_for(|g| *g != generation).await;
    }

    /// Take one pending fault of the selected kind
    fn take_fault(&self, select: impl FnOnce(&mut Faults) -> &mut usize) -> bool {
        let mut faults = self.faults.lock();
        let counter = select(&mut faults);
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

/// In-memory long-poll service; clones share the same state
#[derive(Clone)]
pub struct InMemoryPollService {
    state: Arc<PollState>,
}

impl Default for InMemoryPollService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryPollService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPollService")
            .field("topics", &self.state.topics.len())
            .field("reachable", &self.state.reachable.load(Ordering::SeqCst))
            .finish()
    }
}

impl InMemoryPollService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(PollState {
                topics: DashMap::new(),
                producer_creations: DashMap::new(),
                faults: Mutex::new(Faults::default()),
                reachable: AtomicBool::new(true),
                invisibility: Mutex::new(DEFAULT_INVISIBILITY),
                next_id: AtomicU64::new(1),
                generation: watch::channel(0).0,
                dials: AtomicUsize::new(0),
            }),
        }
    }

    /// Change how long unacknowledged messages stay hidden
    pub fn with_invisibility(self, window: Duration) -> Self {
        *self.state.invisibility.lock() = window;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Drop every client handed out so far; their polls, acks and publishes fail
    pub fn sever(&self) {
        self.state.generation.send_modify(|generation| *generation += 1);
    }

    /// Connect attempts so far, successful or not
    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// The next `count` polls fail with a backend error
    pub fn fail_next_polls(&self, count: usize) {
        self.state.faults.lock().failing_polls = count;
    }

    /// The next `count` polls never return
    pub fn stall_next_polls(&self, count: usize) {
        self.state.faults.lock().stalled_polls = count;
    }

    /// The next `count` acknowledgements are refused for every receipt
    pub fn fail_next_acks(&self, count: usize) {
        self.state.faults.lock().failing_acks = count;
    }

    /// The next `count` producer creations fail
    pub fn fail_next_producers(&self, count: usize) {
        self.state.faults.lock().failing_producers = count;
    }

    /// Slow down producer creation
    pub fn delay_producer_creation(&self, delay: Duration) {
        self.state.faults.lock().producer_delay = Some(delay);
    }

    /// Producers created for `topic` so far
    pub fn producer_creations(&self, topic: &str) -> usize {
        self.state
            .producer_creations
            .get(topic)
            .map_or(0, |count| *count)
    }

    /// Messages ever published to `topic`
    pub fn published(&self, topic: &str) -> usize {
        self.state
            .topics
            .get(topic)
            .map_or(0, |topic| topic.log.lock().messages.len())
    }

    /// Bodies `group` has acknowledged on `topic`
    pub fn acked(&self, topic: &str, group: &str) -> Vec<Vec<u8>> {
        self.state.topics.get(topic).map_or_else(Vec::new, |topic| {
            topic
                .log
                .lock()
                .groups
                .get(group)
                .map_or_else(Vec::new, |state| state.acked.clone())
        })
    }

    /// Messages `group` has polled but not acknowledged
    pub fn inflight(&self, topic: &str, group: &str) -> usize {
        self.state.topics.get(topic).map_or(0, |topic| {
            topic
                .log
                .lock()
                .groups
                .get(group)
                .map_or(0, |state| state.inflight.len())
        })
    }
}

#[async_trait]
impl PollConnector for InMemoryPollService {
    async fn connect(&self, endpoint: &PollEndpoint) -> BrokerResult<Arc<dyn PollClient>> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::connection(format!(
                "{}: service unavailable",
                endpoint.url
            )));
        }
        let generation = *self.state.generation.borrow();
        Ok(Arc::new(InMemoryPollClient {
            state: Arc::clone(&self.state),
            generation,
        }))
    }
}

struct InMemoryPollClient {
    state: Arc<PollState>,
    generation: u64,
}

#[async_trait]
impl TransportLink for InMemoryPollClient {
    async fn closed(&self) -> String {
        self.state.severed(self.generation).await;
        "session expired".to_string()
    }

    async fn close(&self) -> BrokerResult<()> {
        Ok(())
    }
}

#[async_trait]
impl PollClient for InMemoryPollClient {
    async fn producer(&self, topic: &str) -> BrokerResult<Arc<dyn TopicProducer>> {
        let delay = self.state.faults.lock().producer_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.take_fault(|faults| &mut faults.failing_producers) {
            return Err(BrokerError::producer_creation(topic, "topic not found"));
        }
        *self
            .state
            .producer_creations
            .entry(topic.to_string())
            .or_insert(0) += 1;

        Ok(Arc::new(InMemoryProducer {
            state: Arc::clone(&self.state),
            topic: self.state.topic(topic),
            generation: self.generation,
        }))
    }

    async fn consumer(&self, topic: &str, group: &str) -> BrokerResult<Arc<dyn TopicConsumer>> {
        let handle = self.state.topic(topic);
        handle.log.lock().groups.entry(group.to_string()).or_default();
        Ok(Arc::new(InMemoryConsumer {
            state: Arc::clone(&self.state),
            topic: handle,
            group: group.to_string(),
            generation: self.generation,
        }))
    }
}

struct InMemoryProducer {
    state: Arc<PollState>,
    topic: Arc<Topic>,
    generation: u64,
}

#[async_trait]
impl TopicProducer for InMemoryProducer {
    async fn publish(
        &self,
        body: Vec<u8>,
        properties: HashMap<String, String>,
    ) -> BrokerResult<MessageId> {
        if !self.state.is_current(self.generation) {
            return Err(BrokerError::connection("client closed"));
        }
        let message_id = MessageId::new(format!("msg-{:08}", self.state.next_id()));
        self.topic.log.lock().messages.push(StoredMessage {
            message_id: message_id.clone(),
            body,
            properties,
            consumed_times: 0,
        });
        self.topic.arrivals.notify_waiters();
        Ok(message_id)
    }
}

struct InMemoryConsumer {
    state: Arc<PollState>,
    topic: Arc<Topic>,
    group: String,
    generation: u64,
}

impl InMemoryConsumer {
    fn take_batch(&self, max: usize) -> Vec<PolledMessage> {
        let invisibility = *self.state.invisibility.lock();
        let now = Instant::now();
        let mut log = self.topic.log.lock();
        let TopicLog { messages, groups } = &mut *log;
        let group = groups.entry(self.group.clone()).or_default();

        let expired: Vec<ReceiptHandle> = group
            .inflight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(entry) = group.inflight.remove(&receipt) {
                group.redeliver.push_back(entry.message);
            }
        }

        let mut batch = Vec::new();
        while batch.len() < max {
            let next = match group.redeliver.pop_front() {
                Some(message) => message,
                None => match messages.get(group.cursor) {
                    Some(message) => {
                        group.cursor += 1;
                        message.clone()
                    }
                    None => break,
                },
            };

            let mut message = next;
            message.consumed_times += 1;
            let receipt = ReceiptHandle::new(format!(
                "{}-r{}",
                message.message_id,
                self.state.next_id()
            ));
            batch.push(PolledMessage {
                message_id: message.message_id.clone(),
                receipt: receipt.clone(),
                body: message.body.clone(),
                properties: message.properties.clone(),
                consumed_times: message.consumed_times,
            });
            group.inflight.insert(
                receipt,
                Inflight {
                    message,
                    visible_at: now + invisibility,
                },
            );
        }
        batch
    }
}

#[async_trait]
impl TopicConsumer for InMemoryConsumer {
    async fn poll(&self, max: usize, wait: Duration) -> Result<Vec<PolledMessage>, PollError> {
        if !self.state.is_current(self.generation) {
            return Err(PollError::Backend("client closed".to_string()));
        }
        if self.state.take_fault(|faults| &mut faults.stalled_polls) {
            futures::future::pending::<()>().await;
        }
        if self.state.take_fault(|faults| &mut faults.failing_polls) {
            return Err(PollError::Backend("internal server error".to_string()));
        }

        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(wait)
            .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365));
        loop {
            let arrival = self.topic.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let batch = self.take_batch(max.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }

            tokio::select! {
                _ = &mut arrival => {}
                _ = self.state.severed(self.generation) => {
                    return Err(PollError::Backend("client closed".to_string()));
                }
                _ = tokio::time::sleep_until(deadline) => return Err(PollError::NoMessages),
            }
        }
    }

    async fn ack(&self, receipts: &[ReceiptHandle]) -> Result<(), AckFailure> {
        if !self.state.is_current(self.generation) {
            return Err(AckFailure {
                message: "client closed".to_string(),
                items: Vec::new(),
            });
        }
        if self.state.take_fault(|faults| &mut faults.failing_acks) {
            return Err(AckFailure {
                message: "receipt handles rejected".to_string(),
                items: receipts
                    .iter()
                    .map(|receipt| AckFailureItem {
                        receipt: receipt.clone(),
                        code: "ReceiptHandleError".to_string(),
                        message: "the receipt handle has expired".to_string(),
                    })
                    .collect(),
            });
        }

        let mut log = self.topic.log.lock();
        let group = log.groups.entry(self.group.clone()).or_default();
        let mut items = Vec::new();
        for receipt in receipts {
            match group.inflight.remove(receipt) {
                Some(entry) => group.acked.push(entry.message.body),
                None => items.push(AckFailureItem {
                    receipt: receipt.clone(),
                    code: "ReceiptHandleNotExist".to_string(),
                    message: "the receipt handle is unknown".to_string(),
                }),
            }
        }

        if items.is_empty() {
            Ok(())
        } else {
            Err(AckFailure {
                message: format!("{} receipt(s) rejected", items.len()),
                items,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> PollEndpoint {
        PollEndpoint {
            url: "http://in-memory".into(),
            credentials: None,
            instance: None,
            namespace: None,
        }
    }

    #[tokio::test]
    async fn test_groups_read_independently() {
        let service = InMemoryPollService::new();
        let client = service.connect(&endpoint()).await.unwrap();
        let producer = client.producer("orders").await.unwrap();
        producer.publish(b"o-1".to_vec(), HashMap::new()).await.unwrap();

        let billing = client.consumer("orders", "billing").await.unwrap();
        let audit = client.consumer("orders", "audit").await.unwrap();

        let a = billing.poll(3, Duration::from_millis(50)).await.unwrap();
        let b = audit.poll(3, Duration::from_millis(50)).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].receipt, b[0].receipt);
        assert_eq!(a[0].consumed_times, 1);

        billing.ack(&[a[0].receipt.clone()]).await.unwrap();
        assert_eq!(service.acked("orders", "billing"), vec![b"o-1".to_vec()]);
        assert_eq!(service.inflight("orders", "audit"), 1);
    }

    #[tokio::test]
    async fn test_empty_poll_reports_no_messages() {
        let service = InMemoryPollService::new();
        let client = service.connect(&endpoint()).await.unwrap();
        let consumer = client.consumer("orders", "billing").await.unwrap();

        let result = consumer.poll(3, Duration::from_millis(20)).await;
        assert_eq!(result, Err(PollError::NoMessages));
    }

    #[tokio::test]
    async fn test_unacked_message_reappears_after_invisibility() {
        let service = InMemoryPollService::new().with_invisibility(Duration::from_millis(10));
        let client = service.connect(&endpoint()).await.unwrap();
        let producer = client.producer("orders").await.unwrap();
        producer.publish(b"o-1".to_vec(), HashMap::new()).await.unwrap();
        let consumer = client.consumer("orders", "billing").await.unwrap();

        let first = consumer.poll(1, Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = consumer.poll(1, Duration::from_millis(20)).await.unwrap();

        assert_eq!(first[0].message_id, second[0].message_id);
        assert_eq!(second[0].consumed_times, 2);

        let stale = consumer.ack(&[first[0].receipt.clone()]).await.unwrap_err();
        assert_eq!(stale.items.len(), 1);
        assert_eq!(stale.items[0].code, "ReceiptHandleNotExist");
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let service = InMemoryPollService::new();
        service.fail_next_polls(1);
        service.fail_next_producers(1);
        let client = service.connect(&endpoint()).await.unwrap();

        assert!(client.producer("orders").await.is_err());
        assert!(client.producer("orders").await.is_ok());
        assert_eq!(service.producer_creations("orders"), 1);

        let consumer = client.consumer("orders", "billing").await.unwrap();
        assert!(matches!(
            consumer.poll(1, Duration::from_millis(10)).await,
            Err(PollError::Backend(_))
        ));

        service.set_reachable(false);
        assert!(service.connect(&endpoint()).await.is_err());
    }

    #[tokio::test]
    async fn test_sever_kills_existing_clients() {
        let service = InMemoryPollService::new();
        let old = service.connect(&endpoint()).await.unwrap();
        let producer = old.producer("orders").await.unwrap();
        let consumer = old.consumer("orders", "billing").await.unwrap();

        let waiting = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.poll(1, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.sever();

        let polled = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("pending poll should end on sever")
            .unwrap();
        assert!(matches!(polled, Err(PollError::Backend(_))));
        tokio::time::timeout(Duration::from_secs(1), old.closed())
            .await
            .expect("closed() should resolve for a severed client");
        assert!(producer.publish(b"late".to_vec(), HashMap::new()).await.is_err());

        let fresh = service.connect(&endpoint()).await.unwrap();
        let producer = fresh.producer("orders").await.unwrap();
        producer.publish(b"o-1".to_vec(), HashMap::new()).await.unwrap();
        let consumer = fresh.consumer("orders", "billing").await.unwrap();
        assert_eq!(consumer.poll(1, Duration::from_millis(50)).await.unwrap().len(), 1);
        assert_eq!(service.dial_count(), 2);
    }
}
