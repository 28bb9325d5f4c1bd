//! # In-Memory Backends
//!
//! Process-local implementations of both transport seams, used by the test
//! suite and for running services without a broker.
//!
//! ```rust
//! use queue_bridge::messaging::providers::in_memory::InMemoryAmqp;
//! use queue_bridge::messaging::{AmqpBroker, Broker, BrokerOptions};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let backend = InMemoryAmqp::new();
//! let broker = AmqpBroker::new(Arc::new(backend.clone()), BrokerOptions::new());
//! broker.connect().await.unwrap();
//! assert_eq!(backend.dial_count(), 1);
//! broker.disconnect().await.unwrap();
//! # });
//! ```

mod amqp;
mod poll;

pub use amqp::{InMemoryAmqp, SettlementRecord};
pub use poll::{InMemoryPollService, DEFAULT_INVISIBILITY};
