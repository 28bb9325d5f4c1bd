//! # Subscriber State Machine
//!
//! Every subscription is driven by exactly one background task:
//!
//! ```text
//! Created ──> WaitingConnection ──connected──> acquire consumer
//!                  ▲      │                       │ ok        │ err
//!                  │      │ shutdown/stop         ▼           ▼
//!                  │      └──────> exit       Consuming    backoff sleep
//!                  │                              │           │
//!                  └──────── stream ended ────────┘<──────────┘
//!
//! unsubscribe() ──> Unsubscribed (from any state)
//! ```
//!
//! Consumer acquisition failures are retried with capped exponential backoff
//! and never surface to the caller. Unsubscribe is cooperative: it clears the
//! running flag, closes the current consumer handle and wakes the task, while
//! an already executing handler invocation runs to completion.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::codec::Codec;
use super::delivery::{ConsumeExit, DeliveryContext, Halt};
use super::errors::BrokerResult;
use super::handler::Handler;
use super::options::SubscribeConfig;
use crate::resilience::{
    BackoffConfig, ConnectivityWatch, ExponentialBackoff, InFlightTracker, WaitOutcome,
};

/// Observable lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Created,
    WaitingConnection,
    Consuming,
    Unsubscribed,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::WaitingConnection => "waiting_connection",
            Self::Consuming => "consuming",
            Self::Unsubscribed => "unsubscribed",
        };
        f.write_str(name)
    }
}

/// Closes a backend consumer handle (an AMQP channel, a poll consumer)
#[async_trait]
pub trait ConsumerCloser: Send + Sync + 'static {
    async fn close(&self) -> BrokerResult<()>;
}

/// Backend half of a subscription: acquires consumers and runs deliveries
#[async_trait]
pub(crate) trait ConsumerSource: Send + Sync + 'static {
    type Consumer: Send + 'static;

    /// Acquire a consumer for `topic` over the current link
    async fn acquire(
        &self,
        topic: &str,
        config: &SubscribeConfig,
    ) -> BrokerResult<(Self::Consumer, Arc<dyn ConsumerCloser>)>;

    /// Deliver until the backend ends the stream or the subscription halts
    async fn consume(&self, consumer: Self::Consumer, ctx: &DeliveryContext) -> ConsumeExit;
}

struct Control {
    running: bool,
    consumer: Option<Arc<dyn ConsumerCloser>>,
}

struct SubscriptionInner {
    topic: String,
    config: SubscribeConfig,
    provider: &'static str,
    control: parking_lot::Mutex<Control>,
    stop: watch::Sender<bool>,
    state: watch::Sender<SubscriberState>,
    finished: watch::Sender<bool>,
}

impl SubscriptionInner {
    fn is_running(&self) -> bool {
        self.control.lock().running
    }

    /// Move to `next` unless already unsubscribed
    fn transition(&self, next: SubscriberState) {
        self.state.send_if_modified(|state| {
            if *state == SubscriberState::Unsubscribed || *state == next {
                return false;
            }
            debug!(
                provider = self.provider,
                topic = %self.topic,
                from = %state,
                to = %next,
                "Subscriber state transition"
            );
            *state = next;
            true
        });
    }

    /// Store the freshly acquired consumer; false when unsubscribed meanwhile
    fn install_consumer(&self, consumer: Arc<dyn ConsumerCloser>) -> bool {
        let mut control = self.control.lock();
        if !control.running {
            return false;
        }
        control.consumer = Some(consumer);
        true
    }

    fn take_consumer(&self) -> Option<Arc<dyn ConsumerCloser>> {
        self.control.lock().consumer.take()
    }
}

/// Handle to a running subscription
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("provider", &self.inner.provider)
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .finish()
    }
}

impl Subscription {
    /// Options this subscription was created with
    pub fn options(&self) -> &SubscribeConfig {
        &self.inner.config
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn state(&self) -> SubscriberState {
        *self.inner.state.borrow()
    }

    /// Wait for the state to satisfy `predicate`
    pub async fn wait_for_state<F>(&self, predicate: F) -> SubscriberState
    where
        F: Fn(SubscriberState) -> bool,
    {
        let mut state = self.inner.state.subscribe();
        let observed = match state.wait_for(|current| predicate(*current)).await {
            Ok(current) => *current,
            Err(_) => self.state(),
        };
        observed
    }

    /// Wait until the background task has exited
    pub async fn wait_stopped(&self) {
        let mut finished = self.inner.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    /// Stop the subscription.
    ///
    /// Returns the error from closing the current consumer handle, if any. A
    /// handler invocation already executing completes; no further one starts.
    pub async fn unsubscribe(&self) -> BrokerResult<()> {
        let consumer = {
            let mut control = self.inner.control.lock();
            control.running = false;
            self.inner.stop.send_replace(true);
            control.consumer.take()
        };
        self.inner.state.send_replace(SubscriberState::Unsubscribed);

        info!(
            provider = self.inner.provider,
            topic = %self.inner.topic,
            "🛑 Unsubscribed"
        );

        match consumer {
            Some(consumer) => consumer.close().await,
            None => Ok(()),
        }
    }
}

/// Broker-side inputs for a new subscription
pub(crate) struct SubscriberSetup {
    pub topic: String,
    pub config: SubscribeConfig,
    pub provider: &'static str,
    pub handler: Arc<dyn Handler>,
    pub codec: Option<Arc<dyn Codec>>,
    pub inflight: Arc<InFlightTracker>,
    pub connectivity: ConnectivityWatch,
    pub backoff: BackoffConfig,
}

/// Create the subscription handle and start its background task
pub(crate) fn spawn_subscriber<S: ConsumerSource>(
    source: Arc<S>,
    setup: SubscriberSetup,
) -> Subscription {
    let (stop, stop_rx) = watch::channel(false);
    let (state, _) = watch::channel(SubscriberState::Created);
    let (finished, _) = watch::channel(false);

    let inner = Arc::new(SubscriptionInner {
        topic: setup.topic.clone(),
        config: setup.config.clone(),
        provider: setup.provider,
        control: parking_lot::Mutex::new(Control {
            running: true,
            consumer: None,
        }),
        stop,
        state,
        finished,
    });

    let ctx = DeliveryContext {
        topic: setup.topic,
        config: setup.config,
        provider: setup.provider,
        handler: setup.handler,
        codec: setup.codec,
        inflight: setup.inflight,
        halt: Halt::new(stop_rx, setup.connectivity.clone()),
    };

    let task_inner = Arc::clone(&inner);
    tokio::spawn(run_subscriber(
        source,
        task_inner,
        ctx,
        setup.connectivity,
        setup.backoff,
    ));

    Subscription { inner }
}

async fn run_subscriber<S: ConsumerSource>(
    source: Arc<S>,
    inner: Arc<SubscriptionInner>,
    ctx: DeliveryContext,
    mut connectivity: ConnectivityWatch,
    backoff: BackoffConfig,
) {
    let mut backoff = ExponentialBackoff::new(backoff);

    loop {
        if !inner.is_running() {
            break;
        }
        inner.transition(SubscriberState::WaitingConnection);

        let epoch = tokio::select! {
            biased;
            _ = ctx.halt.halted() => break,
            outcome = connectivity.wait_connected() => match outcome {
                WaitOutcome::Connected(epoch) => epoch,
                WaitOutcome::Shutdown => break,
            },
        };

        let (consumer, closer) = match source.acquire(&ctx.topic, &ctx.config).await {
            Ok(acquired) => acquired,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    provider = ctx.provider,
                    topic = %ctx.topic,
                    epoch = epoch,
                    attempt = backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Consumer setup failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = ctx.halt.halted() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };
        backoff.reset();

        if !inner.install_consumer(Arc::clone(&closer)) {
            let _ = closer.close().await;
            break;
        }
        inner.transition(SubscriberState::Consuming);
        info!(
            provider = ctx.provider,
            topic = %ctx.topic,
            epoch = epoch,
            "📥 Subscriber consuming"
        );

        let exit = source.consume(consumer, &ctx).await;

        {
            let mut control = inner.control.lock();
            let current = control
                .consumer
                .as_ref()
                .is_some_and(|installed| Arc::ptr_eq(installed, &closer));
            if current {
                control.consumer = None;
            }
        }

        match exit {
            ConsumeExit::StreamEnded => {
                debug!(
                    provider = ctx.provider,
                    topic = %ctx.topic,
                    "Delivery stream ended, waiting for connectivity"
                );
                let _ = closer.close().await;
            }
            ConsumeExit::Stopped => break,
        }
    }

    if let Some(consumer) = inner.take_consumer() {
        let _ = consumer.close().await;
    }
    inner.transition(SubscriberState::Unsubscribed);
    inner.finished.send_replace(true);
    debug!(provider = ctx.provider, topic = %ctx.topic, "Subscriber task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::delivery::{consume_stream, AckCapability, RawDelivery};
    use crate::messaging::errors::BrokerError;
    use crate::messaging::message::Message;
    use crate::messaging::publication::{Acknowledger, Publication};
    use crate::resilience::ConnectionState;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NoopAcker;

    #[async_trait]
    impl Acknowledger for NoopAcker {
        async fn ack(&self) -> BrokerResult<()> {
            Ok(())
        }

        async fn nack(&self, _requeue: bool) -> BrokerResult<()> {
            Ok(())
        }
    }

    struct NoopCloser;

    #[async_trait]
    impl ConsumerCloser for NoopCloser {
        async fn close(&self) -> BrokerResult<()> {
            Ok(())
        }
    }

    /// Source that fails `failures` acquisitions, then hands out channel-fed streams
    struct ScriptedSource {
        failures: AtomicUsize,
        acquisitions: AtomicUsize,
        feed: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<&'static str>>>,
    }

    #[async_trait]
    impl ConsumerSource for ScriptedSource {
        type Consumer = BoxStream<'static, RawDelivery>;

        async fn acquire(
            &self,
            topic: &str,
            _config: &SubscribeConfig,
        ) -> BrokerResult<(Self::Consumer, Arc<dyn ConsumerCloser>)> {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(BrokerError::consume_setup(topic, "channel refused"));
            }
            let rx = self
                .feed
                .lock()
                .take()
                .ok_or_else(|| BrokerError::consume_setup(topic, "feed exhausted"))?;
            let topic = topic.to_string();
            let stream = futures::stream::unfold(rx, move |mut rx| {
                let topic = topic.clone();
                async move {
                    let body = rx.recv().await?;
                    let delivery = RawDelivery {
                        topic,
                        message: Message::new(body),
                        acker: Arc::new(NoopAcker),
                    };
                    Some((delivery, rx))
                }
            })
            .boxed();
            Ok((stream, Arc::new(NoopCloser)))
        }

        async fn consume(&self, consumer: Self::Consumer, ctx: &DeliveryContext) -> ConsumeExit {
            consume_stream(ctx, consumer, AckCapability::AckNack).await
        }
    }

    fn setup(
        state: &ConnectionState,
        handler: Arc<dyn Handler>,
    ) -> SubscriberSetup {
        SubscriberSetup {
            topic: "orders".into(),
            config: SubscribeConfig::default(),
            provider: "test",
            handler,
            codec: None,
            inflight: Arc::new(InFlightTracker::new()),
            connectivity: state.watch(),
            backoff: BackoffConfig {
                initial_delay_ms: 5,
                multiplier: 2,
                max_delay_ms: 20,
            },
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn Handler> {
        Arc::new(move |_publication: Publication| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_unsubscribe_while_waiting_for_connection() {
        let state = ConnectionState::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(ScriptedSource {
            failures: AtomicUsize::new(0),
            acquisitions: AtomicUsize::new(0),
            feed: parking_lot::Mutex::new(None),
        });

        let subscription = spawn_subscriber(source.clone(), setup(&state, counting_handler(calls.clone())));
        let observed = subscription
            .wait_for_state(|s| s == SubscriberState::WaitingConnection)
            .await;
        assert_eq!(observed, SubscriberState::WaitingConnection);

        subscription.unsubscribe().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), subscription.wait_stopped())
            .await
            .expect("task should exit promptly");

        assert_eq!(subscription.state(), SubscriberState::Unsubscribed);
        assert_eq!(source.acquisitions.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_acquire_failures_are_retried_then_consume() {
        let state = ConnectionState::new();
        state.mark_connected();
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(ScriptedSource {
            failures: AtomicUsize::new(3),
            acquisitions: AtomicUsize::new(0),
            feed: parking_lot::Mutex::new(Some(rx)),
        });

        let subscription = spawn_subscriber(source.clone(), setup(&state, counting_handler(calls.clone())));
        tokio::time::timeout(
            Duration::from_secs(1),
            subscription.wait_for_state(|s| s == SubscriberState::Consuming),
        )
        .await
        .expect("subscriber should reach consuming");
        assert_eq!(source.acquisitions.load(Ordering::SeqCst), 4);

        tx.send("{\"id\":1}").unwrap();
        tx.send("{\"id\":2}").unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        subscription.unsubscribe().await.unwrap();
        subscription.wait_stopped().await;
    }

    #[tokio::test]
    async fn test_shutdown_ends_waiting_subscriber() {
        let state = ConnectionState::new();
        let source = Arc::new(ScriptedSource {
            failures: AtomicUsize::new(0),
            acquisitions: AtomicUsize::new(0),
            feed: parking_lot::Mutex::new(None),
        });
        let subscription = spawn_subscriber(
            source,
            setup(&state, counting_handler(Arc::new(AtomicUsize::new(0)))),
        );

        state.shutdown();
        tokio::time::timeout(Duration::from_secs(1), subscription.wait_stopped())
            .await
            .expect("shutdown should end the task");
        assert_eq!(subscription.state(), SubscriberState::Unsubscribed);
    }
}
