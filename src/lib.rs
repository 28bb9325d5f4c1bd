#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, AMQP in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Queue Bridge
//!
//! One publish/subscribe API over message brokers with very different delivery
//! models, with subscriptions that survive connection loss.
//!
//! ## Overview
//!
//! Applications publish [`messaging::Message`]s to topics and subscribe
//! handlers to them. Two backend families sit behind the same
//! [`messaging::Broker`] trait:
//!
//! - **AMQP** brokers push deliveries over a stream and support ack and
//!   nack with requeue
//! - **Long-poll** HTTP queue services are polled in bounded batches and only
//!   support ack by receipt handle
//!
//! A connection manager redials with capped exponential backoff when the
//! transport drops. Every subscriber runs its own task and moves between
//! waiting for a connection and consuming, so subscriptions resume on their
//! own after reconnect. `disconnect` is permanent and waits for in-flight
//! handlers to finish.
//!
//! ## Module Organization
//!
//! - [`messaging`] - broker trait, adapters, subscriptions and message model
//! - [`resilience`] - connection manager, backoff, connectivity signalling
//! - [`config`] - file and environment configuration
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust
//! use queue_bridge::messaging::providers::in_memory::InMemoryPollService;
//! use queue_bridge::messaging::{
//!     Broker, BrokerOptions, LongPollBroker, Message, Publication, PublishConfig,
//!     SubscribeConfig,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let broker = LongPollBroker::new(
//!     Arc::new(InMemoryPollService::new()),
//!     BrokerOptions::new().with_default_group("billing"),
//! );
//! broker.connect().await.unwrap();
//!
//! broker
//!     .publish("orders", Message::new(r#"{"id":1}"#), PublishConfig::new())
//!     .await
//!     .unwrap();
//!
//! let subscription = broker
//!     .subscribe(
//!         "orders",
//!         Arc::new(|publication: Publication| async move {
//!             let _order: serde_json::Value = publication.message().parse_json()?;
//!             anyhow::Ok(())
//!         }),
//!         SubscribeConfig::new(),
//!     )
//!     .await
//!     .unwrap();
//!
//! subscription.unsubscribe().await.unwrap();
//! broker.disconnect().await.unwrap();
//! # });
//! ```

pub mod config;
pub mod logging;
pub mod messaging;
pub mod resilience;

pub use config::{BridgeConfig, ConfigLoader, ConfigurationError};
pub use messaging::{
    AmqpBroker, Broker, BrokerError, BrokerOptions, BrokerProvider, BrokerResult, Handler,
    LongPollBroker, Message, Publication, PublishConfig, SubscribeConfig, Subscription,
};
