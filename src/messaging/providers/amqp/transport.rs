//! # AMQP Transport Seam
//!
//! The vendor-facing half of the AMQP adapter. A connector dials sessions; a
//! session publishes and opens consumers. The `lapin` implementation lives in
//! `lapin_transport` behind the `rabbitmq` feature and the in-memory broker in
//! `providers::in_memory` implements the same traits for tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;

use crate::messaging::errors::BrokerResult;
use crate::messaging::message::Message;
use crate::messaging::options::{Credentials, ExchangeConfig, PublishConfig, TlsConfig};
use crate::messaging::publication::Acknowledger;
use crate::messaging::subscriber::ConsumerCloser;
use crate::resilience::TransportLink;

/// Everything needed to dial one address
#[derive(Debug, Clone)]
pub struct AmqpEndpoint {
    /// Full URL, already upgraded to `amqps://` when secure
    pub url: String,
    pub tls: Option<TlsConfig>,
    pub credentials: Option<Credentials>,
    pub exchange: ExchangeConfig,
    pub prefetch_count: u16,
    pub prefetch_global: bool,
    pub connection_name: Option<String>,
}

/// Dials AMQP sessions
#[async_trait]
pub trait AmqpConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &AmqpEndpoint) -> BrokerResult<Arc<dyn AmqpSession>>;
}

/// One live AMQP connection
#[async_trait]
pub trait AmqpSession: TransportLink {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> BrokerResult<()>;

    /// Declare and bind the queue described by `spec`, then start consuming
    async fn consume(&self, spec: &ConsumeSpec) -> BrokerResult<AmqpConsumer>;

    /// Replace the publishing channel after the broker closed it.
    ///
    /// A channel-level error (unknown exchange, oversized frame) closes only
    /// that channel; the connection and its consumers stay up.
    async fn reopen_publisher(&self) -> BrokerResult<()> {
        Ok(())
    }
}

/// An outgoing message with its AMQP basic properties
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publishing {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl Publishing {
    /// Map a message and its publish options onto AMQP properties.
    ///
    /// Message headers are applied first; headers from `config` override them.
    pub fn build(message: Message, config: &PublishConfig) -> Self {
        let Message { mut headers, body } = message;
        headers.extend(
            config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Self {
            body,
            headers,
            delivery_mode: config.delivery_mode.map(|mode| mode.as_u8()),
            priority: config.priority,
            content_type: config.content_type.clone(),
            content_encoding: config.content_encoding.clone(),
            correlation_id: config.correlation_id.clone(),
            reply_to: config.reply_to.clone(),
            expiration: config.expiration.clone(),
            message_id: config.message_id.clone(),
            timestamp: config
                .timestamp
                .and_then(|ts| u64::try_from(ts.timestamp()).ok()),
            kind: config.kind.clone(),
            user_id: config.user_id.clone(),
            app_id: config.app_id.clone(),
        }
    }
}

/// Queue declaration, binding and consume parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeSpec {
    /// Empty means a server-named, exclusive, auto-delete queue
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub durable_queue: bool,
    /// Deliveries are settled by the broker on send
    pub no_ack: bool,
    pub queue_args: HashMap<String, serde_json::Value>,
    pub bind_args: HashMap<String, serde_json::Value>,
    pub consumer_tag: String,
}

/// One push delivery
pub struct AmqpDelivery {
    pub routing_key: String,
    /// Raw header table; values are converted to strings by the adapter
    pub headers: HashMap<String, serde_json::Value>,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub acker: Arc<dyn Acknowledger>,
}

impl std::fmt::Debug for AmqpDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpDelivery")
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A started consumer: its delivery stream plus the channel that owns it
pub struct AmqpConsumer {
    pub deliveries: BoxStream<'static, AmqpDelivery>,
    pub channel: Arc<dyn ConsumerCloser>,
}

/// Convert a raw header table into string headers.
///
/// Strings pass through; numbers and booleans are rendered with `to_string`;
/// nulls, arrays and nested tables are dropped.
pub fn stringify_headers(raw: HashMap<String, serde_json::Value>) -> HashMap<String, String> {
    raw.into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null
                | serde_json::Value::Array(_)
                | serde_json::Value::Object(_) => return None,
            };
            Some((key, value))
        })
        .collect()
}
