//! # Long-Poll Broker Adapter
//!
//! Bounded long-poll delivery over any [`PollConnector`]. The backend only
//! acknowledges, so every processed message is acked after its handler
//! returns, whatever the outcome; a failed handler is logged and the message
//! is not retried by this layer.
//!
//! One poll per iteration races three outcomes:
//!
//! - a batch of messages, each delivered in order
//! - "no messages" from the service, which loops immediately
//! - the local safety timeout (always longer than the service wait), idle
//!
//! Any other service error is logged and followed by a fixed cooldown.
//! Unsubscribe interrupts a pending poll.

pub mod transport;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::logging;
use crate::messaging::broker::Broker;
use crate::messaging::delivery::{
    AckCapability, ConsumeExit, DeliveryContext, DeliveryOutcome, RawDelivery,
};
use crate::messaging::errors::{BrokerError, BrokerResult};
use crate::messaging::handler::Handler;
use crate::messaging::message::{Message, ReceiptHandle};
use crate::messaging::options::{BrokerOptions, LongPollSettings, PublishConfig, SubscribeConfig};
use crate::messaging::publication::Acknowledger;
use crate::messaging::subscriber::{
    spawn_subscriber, ConsumerCloser, ConsumerSource, SubscriberSetup, Subscription,
};
use crate::resilience::{
    BackoffConfig, ConnectionManager, ConnectivityWatch, Dialer, InFlightTracker, LinkStatus,
    SlotResources,
};

pub use transport::{
    AckFailure, AckFailureItem, PollClient, PollConnector, PollEndpoint, PollError,
    PolledMessage, TopicConsumer, TopicProducer,
};

/// Endpoint used when no address is configured
pub const DEFAULT_POLL_ADDRESS: &str = "http://127.0.0.1:9876";

const PROVIDER: &str = "long_poll";

/// Per-topic producers, created once and reused by every publish
#[derive(Default)]
pub struct ProducerCache {
    producers: HashMap<String, Arc<dyn TopicProducer>>,
}

impl ProducerCache {
    pub fn get(&self, topic: &str) -> Option<Arc<dyn TopicProducer>> {
        self.producers.get(topic).cloned()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

impl SlotResources for ProducerCache {
    fn reset(&mut self) {
        self.producers.clear();
    }
}

/// Creates the service client for the primary address
pub struct LongPollDialer {
    connector: Arc<dyn PollConnector>,
    options: Arc<RwLock<BrokerOptions>>,
}

impl LongPollDialer {
    fn poll_endpoint(&self) -> PollEndpoint {
        let options = self.options.read();
        PollEndpoint {
            url: options
                .primary_address()
                .unwrap_or(DEFAULT_POLL_ADDRESS)
                .to_string(),
            credentials: options.credentials.clone(),
            instance: options.long_poll.instance.clone(),
            namespace: options.long_poll.namespace.clone(),
        }
    }
}

#[async_trait]
impl Dialer for LongPollDialer {
    type Link = dyn PollClient;

    async fn dial(&self) -> BrokerResult<Arc<dyn PollClient>> {
        let endpoint = self.poll_endpoint();
        self.connector.connect(&endpoint).await
    }

    fn endpoint(&self) -> String {
        self.poll_endpoint().url
    }

    fn backoff(&self) -> BackoffConfig {
        self.options.read().backoff
    }
}

/// Long-poll implementation of [`Broker`]
pub struct LongPollBroker {
    options: Arc<RwLock<BrokerOptions>>,
    manager: Arc<ConnectionManager<LongPollDialer, ProducerCache>>,
    inflight: Arc<InFlightTracker>,
}

impl std::fmt::Debug for LongPollBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongPollBroker")
            .field("address", &self.address())
            .field("status", &self.status())
            .field("in_flight", &self.inflight.active())
            .finish()
    }
}

impl LongPollBroker {
    pub fn new(connector: Arc<dyn PollConnector>, options: BrokerOptions) -> Self {
        let options = Arc::new(RwLock::new(options));
        let dialer = LongPollDialer {
            connector,
            options: Arc::clone(&options),
        };
        Self {
            options,
            manager: Arc::new(ConnectionManager::new(PROVIDER, dialer)),
            inflight: Arc::new(InFlightTracker::new()),
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.manager.state().snapshot()
    }

    pub fn connectivity(&self) -> ConnectivityWatch {
        self.manager.watch()
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.active()
    }

    /// Number of topics with a cached producer
    pub async fn cached_producers(&self) -> usize {
        self.manager.lock().await.resources.len()
    }

    /// Producer for `topic`, created on first use.
    ///
    /// The shared lock is held across creation, so concurrent first publishes
    /// to a topic create exactly one producer. Creation errors are not cached.
    async fn producer(&self, topic: &str) -> BrokerResult<Arc<dyn TopicProducer>> {
        let mut slot = self.manager.lock().await;
        if let Some(producer) = slot.resources.get(topic) {
            return Ok(producer);
        }

        let client = slot.require_link("publish")?;
        let producer = client.producer(topic).await.map_err(|e| match e {
            BrokerError::ProducerCreation { .. } => e,
            other => BrokerError::producer_creation(topic, other.to_string()),
        })?;
        slot.resources
            .producers
            .insert(topic.to_string(), Arc::clone(&producer));
        info!(provider = PROVIDER, topic = %topic, "Created producer");
        Ok(producer)
    }
}

#[async_trait]
impl Broker for LongPollBroker {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn address(&self) -> String {
        self.options
            .read()
            .primary_address()
            .unwrap_or(DEFAULT_POLL_ADDRESS)
            .to_string()
    }

    fn options(&self) -> BrokerOptions {
        self.options.read().clone()
    }

    async fn init(&self, options: BrokerOptions) -> BrokerResult<()> {
        let state = self.manager.state();
        if state.has_connected() || state.is_shutdown() {
            return Err(BrokerError::configuration(
                PROVIDER,
                "options cannot change after connect",
            ));
        }
        *self.options.write() = options;
        Ok(())
    }

    async fn connect(&self) -> BrokerResult<()> {
        let address = logging::redact_address(&self.address());
        self.manager.connect().await.map_err(|e| {
            logging::log_error("LongPollBroker", "connect", &e.to_string(), Some(&address));
            e
        })?;
        logging::log_broker_operation("CONNECT", PROVIDER, None, "SUCCESS", Some(&address));
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        let result = self.manager.disconnect().await;
        self.inflight.wait_idle().await;
        let status = if result.is_ok() { "SUCCESS" } else { "FAILED" };
        logging::log_broker_operation("DISCONNECT", PROVIDER, None, status, None);
        result
    }

    async fn publish(
        &self,
        topic: &str,
        message: Message,
        config: PublishConfig,
    ) -> BrokerResult<()> {
        let codec = self.options.read().codec.clone();
        let Message { mut headers, mut body } = message;
        if let Some(codec) = codec {
            body = codec.encode(&body)?;
        }
        headers.extend(config.headers);

        let producer = self.producer(topic).await?;
        let message_id = producer.publish(body, headers).await.map_err(|e| {
            logging::log_error("LongPollBroker", "publish", &e.to_string(), Some(topic));
            match e {
                BrokerError::Publish { .. } => e,
                other => BrokerError::publish(topic, other.to_string()),
            }
        })?;
        trace!(provider = PROVIDER, topic = %topic, message_id = %message_id, "Published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        config: SubscribeConfig,
    ) -> BrokerResult<Subscription> {
        let state = self.manager.state();
        if state.is_shutdown() {
            return Err(BrokerError::Shutdown);
        }
        if !state.has_connected() {
            return Err(BrokerError::not_connected("subscribe"));
        }

        let (settings, codec, backoff) = {
            let options = self.options.read();
            (
                options.long_poll.clone(),
                options.codec.clone(),
                options.backoff,
            )
        };
        let group = config
            .queue
            .clone()
            .or_else(|| settings.default_group.clone())
            .ok_or_else(|| {
                BrokerError::configuration(
                    "subscribe",
                    format!("no consumer group for topic {topic}: set a queue or a default group"),
                )
            })?;

        info!(
            provider = PROVIDER,
            topic = %topic,
            group = %group,
            batch_size = settings.effective_batch_size(),
            poll_wait_ms = settings.poll_wait.as_millis() as u64,
            "📬 Subscribing"
        );

        let source = Arc::new(LongPollSource {
            manager: Arc::clone(&self.manager),
            group,
            settings,
        });

        Ok(spawn_subscriber(
            source,
            SubscriberSetup {
                topic: topic.to_string(),
                config,
                provider: PROVIDER,
                handler,
                codec,
                inflight: Arc::clone(&self.inflight),
                connectivity: self.manager.watch(),
                backoff,
            },
        ))
    }
}

/// A group consumer plus the connectivity epoch of the client it came from
struct PollConsumer {
    consumer: Arc<dyn TopicConsumer>,
    epoch: u64,
}

struct LongPollSource {
    manager: Arc<ConnectionManager<LongPollDialer, ProducerCache>>,
    group: String,
    settings: LongPollSettings,
}

impl LongPollSource {
    /// Sleep the error cooldown; true when halted meanwhile
    async fn cool_down(&self, ctx: &DeliveryContext) -> bool {
        tokio::select! {
            biased;
            _ = ctx.halt.halted() => true,
            _ = tokio::time::sleep(self.settings.error_cooldown) => false,
        }
    }
}

#[async_trait]
impl ConsumerSource for LongPollSource {
    type Consumer = PollConsumer;

    async fn acquire(
        &self,
        topic: &str,
        _config: &SubscribeConfig,
    ) -> BrokerResult<(Self::Consumer, Arc<dyn ConsumerCloser>)> {
        let slot = self.manager.lock().await;
        let client = slot
            .link()
            .ok_or_else(|| BrokerError::consume_setup(topic, "no live client"))?;
        // The link cannot be swapped while the slot is held
        let epoch = self.manager.state().epoch();
        let consumer = client
            .consumer(topic, &self.group)
            .await
            .map_err(|e| BrokerError::consume_setup(topic, e.to_string()))?;
        drop(slot);

        let closer: Arc<dyn ConsumerCloser> = Arc::new(PollConsumerHandle {
            consumer: Arc::clone(&consumer),
        });
        Ok((PollConsumer { consumer, epoch }, closer))
    }

    async fn consume(&self, consumer: Self::Consumer, ctx: &DeliveryContext) -> ConsumeExit {
        let PollConsumer { consumer, epoch } = consumer;
        let batch_size = self.settings.effective_batch_size();
        let poll_wait = self.settings.poll_wait;
        let local_timeout = self.settings.effective_local_timeout();
        let mut link = self.manager.watch();

        loop {
            let polled = tokio::select! {
                biased;
                _ = ctx.halt.halted() => return ConsumeExit::Stopped,
                _ = link.wait_link_change(epoch) => {
                    debug!(
                        provider = PROVIDER,
                        topic = %ctx.topic,
                        group = %self.group,
                        epoch = epoch,
                        "Client connection changed, releasing consumer"
                    );
                    return ConsumeExit::StreamEnded;
                }
                polled = tokio::time::timeout(local_timeout, consumer.poll(batch_size, poll_wait)) => polled,
            };

            let messages = match polled {
                Err(_) => {
                    trace!(topic = %ctx.topic, timeout_ms = local_timeout.as_millis() as u64, "Long poll timed out locally");
                    continue;
                }
                Ok(Err(PollError::NoMessages)) => {
                    trace!(topic = %ctx.topic, group = %self.group, "No new messages");
                    continue;
                }
                Ok(Err(PollError::Backend(message))) => {
                    let err = BrokerError::backend_poll(&ctx.topic, message);
                    error!(
                        provider = PROVIDER,
                        group = %self.group,
                        error = %err,
                        cooldown_ms = self.settings.error_cooldown.as_millis() as u64,
                        "Long poll failed"
                    );
                    if self.cool_down(ctx).await {
                        return ConsumeExit::Stopped;
                    }
                    continue;
                }
                Ok(Ok(messages)) => messages,
            };

            for polled in messages {
                let delivery = RawDelivery {
                    topic: ctx.topic.clone(),
                    message: Message {
                        headers: polled.properties,
                        body: polled.body,
                    },
                    acker: Arc::new(ReceiptAcker {
                        consumer: Arc::clone(&consumer),
                        receipt: polled.receipt,
                    }),
                };

                match ctx.deliver(delivery, AckCapability::AckOnly).await {
                    DeliveryOutcome::Halted => return ConsumeExit::Stopped,
                    DeliveryOutcome::Delivered {
                        settle_failed: true,
                    } => {
                        if self.cool_down(ctx).await {
                            return ConsumeExit::Stopped;
                        }
                    }
                    DeliveryOutcome::Delivered { .. } => {}
                }
            }
        }
    }
}

/// Acknowledges one polled message by its receipt handle
struct ReceiptAcker {
    consumer: Arc<dyn TopicConsumer>,
    receipt: ReceiptHandle,
}

#[async_trait]
impl Acknowledger for ReceiptAcker {
    async fn ack(&self) -> BrokerResult<()> {
        match self.consumer.ack(std::slice::from_ref(&self.receipt)).await {
            Ok(()) => Ok(()),
            Err(failure) => {
                if failure.items.is_empty() {
                    error!(provider = PROVIDER, receipt = %self.receipt, error = %failure, "Ack failed");
                }
                for item in &failure.items {
                    // Receipt handles time out when processing outlives the invisibility window
                    error!(
                        provider = PROVIDER,
                        receipt = %item.receipt,
                        code = %item.code,
                        message = %item.message,
                        "Ack rejected for receipt"
                    );
                }
                Err(BrokerError::ack(failure.to_string()))
            }
        }
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        warn!(provider = PROVIDER, requeue = requeue, "nack is not supported by long-poll services");
        Err(BrokerError::unsupported(PROVIDER, "nack"))
    }

    fn supports_nack(&self) -> bool {
        false
    }

    fn provider(&self) -> &'static str {
        PROVIDER
    }
}

struct PollConsumerHandle {
    consumer: Arc<dyn TopicConsumer>,
}

#[async_trait]
impl ConsumerCloser for PollConsumerHandle {
    async fn close(&self) -> BrokerResult<()> {
        self.consumer.close().await
    }
}
