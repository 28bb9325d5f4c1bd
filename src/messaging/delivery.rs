//! # Delivery Loop
//!
//! Turns raw backend deliveries into publications, runs the handler and
//! resolves exactly one settlement per delivery.
//!
//! ## Settlement rules
//!
//! | backend  | auto-ack | handler | ack-on-success | outcome                  |
//! |----------|----------|---------|----------------|--------------------------|
//! | ack/nack | on       | any     | any            | none (backend settles)   |
//! | ack/nack | off      | ok      | on             | ack                      |
//! | ack/nack | off      | ok      | off            | none (caller settles)    |
//! | ack/nack | off      | err     | any            | nack(requeue_on_error)   |
//! | ack-only | any      | any     | any            | ack                      |
//!
//! A publication the handler already settled is never settled again.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::codec::Codec;
use super::errors::BrokerError;
use super::handler::Handler;
use super::message::Message;
use super::options::SubscribeConfig;
use super::publication::{Acknowledger, Publication};
use crate::resilience::{ConnectivityWatch, InFlightTracker};

/// Settlement primitives a backend offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCapability {
    /// Push brokers with ack and nack(requeue)
    AckNack,
    /// Long-poll services that only acknowledge; unacked items reappear
    AckOnly,
}

/// What the delivery loop does after the handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    Skip,
}

/// Decide the settlement for one delivery
pub fn settle_decision(
    handler_ok: bool,
    config: &SubscribeConfig,
    capability: AckCapability,
) -> Settlement {
    match capability {
        AckCapability::AckOnly => Settlement::Ack,
        AckCapability::AckNack if config.auto_ack => Settlement::Skip,
        AckCapability::AckNack if handler_ok && config.ack_on_success => Settlement::Ack,
        AckCapability::AckNack if handler_ok => Settlement::Skip,
        AckCapability::AckNack => Settlement::Nack {
            requeue: config.requeue_on_error,
        },
    }
}

/// Why a consume strategy returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumeExit {
    /// The backend ended the delivery stream; wait for connectivity again
    StreamEnded,
    /// Unsubscribed or shut down
    Stopped,
}

/// One delivery as handed over by a backend adapter
pub(crate) struct RawDelivery {
    pub topic: String,
    pub message: Message,
    pub acker: Arc<dyn Acknowledger>,
}

/// Result of handing one delivery to the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    /// Stopped before the handler ran
    Halted,
    /// Handler ran; settlement failed when `settle_failed`
    Delivered { settle_failed: bool },
}

/// Combined stop condition: the subscription's stop signal or broker shutdown
#[derive(Debug, Clone)]
pub(crate) struct Halt {
    stop: watch::Receiver<bool>,
    connectivity: ConnectivityWatch,
}

impl Halt {
    pub(crate) fn new(stop: watch::Receiver<bool>, connectivity: ConnectivityWatch) -> Self {
        Self { stop, connectivity }
    }

    pub(crate) fn is_halted(&self) -> bool {
        *self.stop.borrow() || self.connectivity.snapshot().shutdown
    }

    /// Resolve once the subscription is stopped or the broker shuts down
    pub(crate) async fn halted(&self) {
        let mut stop = self.stop.clone();
        let mut connectivity = self.connectivity.clone();
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => {}
            _ = connectivity.wait_shutdown() => {}
        }
    }
}

/// Everything a consume strategy needs to deliver for one subscription
pub(crate) struct DeliveryContext {
    pub topic: String,
    pub config: SubscribeConfig,
    pub provider: &'static str,
    pub handler: Arc<dyn Handler>,
    pub codec: Option<Arc<dyn Codec>>,
    pub inflight: Arc<InFlightTracker>,
    pub halt: Halt,
}

impl DeliveryContext {
    /// Build a publication, decoding the body when a codec is configured
    pub(crate) fn publication(&self, delivery: RawDelivery) -> Publication {
        let RawDelivery {
            topic,
            mut message,
            acker,
        } = delivery;

        let decode_error = match &self.codec {
            Some(codec) => match codec.decode(&message.body) {
                Ok(body) => {
                    message.body = body;
                    None
                }
                Err(e) => Some(BrokerError::delivery_decode(&topic, e.to_string())),
            },
            None => None,
        };

        Publication::new(topic, message, acker, self.config.requeue_on_error)
            .with_error(decode_error)
    }

    /// Run the handler for one delivery and settle it
    pub(crate) async fn deliver(
        &self,
        delivery: RawDelivery,
        capability: AckCapability,
    ) -> DeliveryOutcome {
        // Registered before the stop check so disconnect() cannot miss it
        let _guard = self.inflight.begin();
        if self.halt.is_halted() {
            return DeliveryOutcome::Halted;
        }

        let publication = self.publication(delivery);
        if let Some(decode_error) = publication.error() {
            warn!(
                provider = self.provider,
                topic = %publication.topic(),
                error = %decode_error,
                "Delivered body failed to decode, handing raw body to handler"
            );
        }

        let result = self.handler.handle(publication.clone()).await;
        if let Err(e) = &result {
            error!(
                provider = self.provider,
                topic = %publication.topic(),
                subscription = %self.topic,
                error = %e,
                "❌ Handler failed to process message"
            );
        }

        if publication.is_settled() {
            debug!(topic = %publication.topic(), "Handler settled the publication itself");
            return DeliveryOutcome::Delivered {
                settle_failed: false,
            };
        }

        let settled = match settle_decision(result.is_ok(), &self.config, capability) {
            Settlement::Skip => return DeliveryOutcome::Delivered {
                settle_failed: false,
            },
            Settlement::Ack => publication.ack().await,
            Settlement::Nack { requeue } => publication.nack_with(requeue).await,
        };

        match settled {
            Ok(()) => DeliveryOutcome::Delivered {
                settle_failed: false,
            },
            Err(e) => {
                warn!(
                    provider = self.provider,
                    topic = %publication.topic(),
                    error = %e,
                    "Failed to settle delivery"
                );
                DeliveryOutcome::Delivered {
                    settle_failed: true,
                }
            }
        }
    }
}

/// Push-stream strategy: deliver items one at a time until the stream ends
/// or the subscription halts
pub(crate) async fn consume_stream<S>(
    ctx: &DeliveryContext,
    mut deliveries: S,
    capability: AckCapability,
) -> ConsumeExit
where
    S: Stream<Item = RawDelivery> + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.halt.halted() => return ConsumeExit::Stopped,
            next = deliveries.next() => next,
        };

        let Some(delivery) = next else {
            return ConsumeExit::StreamEnded;
        };

        if ctx.deliver(delivery, capability).await == DeliveryOutcome::Halted {
            return ConsumeExit::Stopped;
        }
        // A requeued delivery can be ready again immediately
        tokio::task::yield_now().await;
    }
}
