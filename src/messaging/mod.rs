//! # Messaging Module
//!
//! Broker-agnostic publish/subscribe with automatic reconnect.
//!
//! ## Architecture
//!
//! ```text
//! BrokerProvider (enum)          <- runtime backend selection
//!   ├── Amqp(AmqpBroker)         <- push stream, ack + nack(requeue)
//!   └── LongPoll(LongPollBroker) <- bounded long poll, ack only
//!
//! Subscription                   <- one task per subscriber
//!   Created -> WaitingConnection <-> Consuming -> Unsubscribed
//! ```
//!
//! ## Module Structure
//!
//! - `broker` - the `Broker` capability trait
//! - `message` - `Message` plus id/receipt newtypes
//! - `options` - broker, publish and subscribe options
//! - `publication` - a delivered message and its settlement
//! - `handler` - subscription handlers
//! - `delivery` - settlement rules and the shared delivery path
//! - `subscriber` - subscriber state machine
//! - `codec` - optional body codecs
//! - `errors` - `BrokerError`
//! - `providers` - backend adapters and in-memory backends
//!
//! ## Usage
//!
//! ```rust
//! use queue_bridge::messaging::providers::in_memory::InMemoryAmqp;
//! use queue_bridge::messaging::{
//!     AmqpBroker, Broker, BrokerOptions, Message, Publication, PublishConfig, SubscribeConfig,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let broker = AmqpBroker::new(Arc::new(InMemoryAmqp::new()), BrokerOptions::new());
//! broker.connect().await.unwrap();
//!
//! let subscription = broker
//!     .subscribe(
//!         "orders",
//!         Arc::new(|publication: Publication| async move {
//!             println!("{:?}", publication.message().body_str());
//!             anyhow::Ok(())
//!         }),
//!         SubscribeConfig::new().with_queue("billing").ack_on_success(),
//!     )
//!     .await
//!     .unwrap();
//!
//! broker
//!     .publish("orders", Message::new("order-1"), PublishConfig::new())
//!     .await
//!     .unwrap();
//!
//! subscription.unsubscribe().await.unwrap();
//! broker.disconnect().await.unwrap();
//! # });
//! ```

pub mod broker;
pub mod codec;
pub mod delivery;
pub mod errors;
pub mod handler;
pub mod message;
pub mod options;
pub mod providers;
pub mod publication;
pub mod subscriber;

pub use broker::Broker;
pub use codec::{Codec, JsonCodec, RawCodec};
pub use delivery::{settle_decision, AckCapability, Settlement};
pub use errors::{BrokerError, BrokerResult};
pub use handler::Handler;
pub use message::{Message, MessageId, ReceiptHandle};
pub use options::{
    BrokerOptions, Credentials, DeliveryMode, ExchangeConfig, LongPollSettings, PublishConfig,
    SubscribeConfig, TlsConfig,
};
pub use providers::{AmqpBroker, BrokerProvider, LongPollBroker, ProviderKind};
pub use publication::{Acknowledger, Publication};
pub use subscriber::{ConsumerCloser, SubscriberState, Subscription};
