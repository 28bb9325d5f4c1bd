//! # Broker Providers
//!
//! Enum dispatch over the backend adapters.
//!
//! - [`amqp`] - push-stream delivery with ack and nack(requeue)
//! - [`long_poll`] - bounded long-poll delivery, ack only
//! - [`in_memory`] - process-local implementations of both transport seams

pub mod amqp;
pub mod in_memory;
pub mod long_poll;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::broker::Broker;
use super::errors::{BrokerError, BrokerResult};
use super::handler::Handler;
use super::message::Message;
use super::options::{BrokerOptions, PublishConfig, SubscribeConfig};
use super::subscriber::Subscription;
use crate::resilience::{ConnectivityWatch, LinkStatus};

pub use amqp::AmqpBroker;
pub use long_poll::LongPollBroker;

/// Which backend a configuration selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Amqp,
    LongPoll,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amqp => "amqp",
            Self::LongPoll => "long_poll",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amqp" | "rabbitmq" => Ok(Self::Amqp),
            "long_poll" | "longpoll" | "http" => Ok(Self::LongPoll),
            other => Err(BrokerError::configuration(
                "provider",
                format!("unknown provider '{other}'"),
            )),
        }
    }
}

/// Broker backend selected at runtime
///
/// # Example
///
/// ```rust
/// use queue_bridge::messaging::providers::in_memory::InMemoryPollService;
/// use queue_bridge::messaging::providers::{BrokerProvider, LongPollBroker};
/// use queue_bridge::messaging::BrokerOptions;
/// use std::sync::Arc;
///
/// let service = InMemoryPollService::new();
/// let provider = BrokerProvider::LongPoll(LongPollBroker::new(
///     Arc::new(service),
///     BrokerOptions::new().with_default_group("billing"),
/// ));
/// assert_eq!(provider.provider_name(), "long_poll");
/// ```
#[derive(Debug)]
pub enum BrokerProvider {
    Amqp(AmqpBroker),
    LongPoll(LongPollBroker),
}

impl BrokerProvider {
    /// Provider name for logging
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Amqp(b) => b.name(),
            Self::LongPoll(b) => b.name(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Amqp(_) => ProviderKind::Amqp,
            Self::LongPoll(_) => ProviderKind::LongPoll,
        }
    }

    pub fn status(&self) -> LinkStatus {
        match self {
            Self::Amqp(b) => b.status(),
            Self::LongPoll(b) => b.status(),
        }
    }

    pub fn connectivity(&self) -> ConnectivityWatch {
        match self {
            Self::Amqp(b) => b.connectivity(),
            Self::LongPoll(b) => b.connectivity(),
        }
    }

    pub fn in_flight(&self) -> usize {
        match self {
            Self::Amqp(b) => b.in_flight(),
            Self::LongPoll(b) => b.in_flight(),
        }
    }

    /// Provider as a trait object, for code generic over backends
    pub fn as_broker(&self) -> &dyn Broker {
        match self {
            Self::Amqp(b) => b,
            Self::LongPoll(b) => b,
        }
    }
}

#[async_trait]
impl Broker for BrokerProvider {
    fn name(&self) -> &'static str {
        self.provider_name()
    }

    fn address(&self) -> String {
        self.as_broker().address()
    }

    fn options(&self) -> BrokerOptions {
        self.as_broker().options()
    }

    async fn init(&self, options: BrokerOptions) -> BrokerResult<()> {
        match self {
            Self::Amqp(b) => b.init(options).await,
            Self::LongPoll(b) => b.init(options).await,
        }
    }

    async fn connect(&self) -> BrokerResult<()> {
        match self {
            Self::Amqp(b) => b.connect().await,
            Self::LongPoll(b) => b.connect().await,
        }
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        match self {
            Self::Amqp(b) => b.disconnect().await,
            Self::LongPoll(b) => b.disconnect().await,
        }
    }

    async fn publish(
        &self,
        topic: &str,
        message: Message,
        config: PublishConfig,
    ) -> BrokerResult<()> {
        match self {
            Self::Amqp(b) => b.publish(topic, message, config).await,
            Self::LongPoll(b) => b.publish(topic, message, config).await,
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        config: SubscribeConfig,
    ) -> BrokerResult<Subscription> {
        match self {
            Self::Amqp(b) => b.subscribe(topic, handler, config).await,
            Self::LongPoll(b) => b.subscribe(topic, handler, config).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use in_memory::InMemoryAmqp;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("amqp".parse::<ProviderKind>().unwrap(), ProviderKind::Amqp);
        assert_eq!("RabbitMQ".parse::<ProviderKind>().unwrap(), ProviderKind::Amqp);
        assert_eq!(
            "long_poll".parse::<ProviderKind>().unwrap(),
            ProviderKind::LongPoll
        );
        assert!("kafka".parse::<ProviderKind>().is_err());
        assert_eq!(ProviderKind::LongPoll.to_string(), "long_poll");
    }

    #[tokio::test]
    async fn test_enum_dispatch_reaches_adapter() {
        let backend = InMemoryAmqp::new();
        let provider = BrokerProvider::Amqp(AmqpBroker::new(
            Arc::new(backend.clone()),
            BrokerOptions::new(),
        ));
        assert_eq!(provider.provider_name(), "rabbitmq");
        assert_eq!(provider.kind(), ProviderKind::Amqp);
        assert!(!provider.status().connected);

        provider.connect().await.unwrap();
        assert!(provider.status().connected);
        provider
            .publish("orders", Message::new("hello"), PublishConfig::new())
            .await
            .unwrap();
        assert_eq!(backend.published().len(), 1);

        provider.disconnect().await.unwrap();
        assert!(provider.status().shutdown);
    }
}
