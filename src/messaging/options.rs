//! # Broker, Publish and Subscribe Options
//!
//! Strongly-typed configuration records populated through builders. Every
//! default is supplied by a constructor here; nothing is read from globals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::codec::Codec;
use crate::resilience::BackoffConfig;

/// Default exchange declared by the AMQP adapter
pub const DEFAULT_EXCHANGE: &str = "queue-bridge";
/// Default long-poll batch size
pub const DEFAULT_BATCH_SIZE: usize = 3;
/// Largest batch the long-poll backend accepts in one request
pub const MAX_BATCH_SIZE: usize = 16;
/// Default server-side long-poll wait
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(3);
/// Default local safety timeout around one poll; must exceed the poll wait
pub const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(35);
/// Default pause after a backend poll or ack error
pub const DEFAULT_ERROR_COOLDOWN: Duration = Duration::from_secs(3);

/// AMQP delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// Wire value of the delivery mode property
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }
}

/// Per-publish options. Fields a backend cannot express are ignored by it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishConfig {
    pub delivery_mode: Option<DeliveryMode>,
    pub priority: Option<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, AMQP string form
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Application message type
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    /// Headers merged over the message's own headers
    pub headers: HashMap<String, String>,
}

impl PublishConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    pub fn persistent(self) -> Self {
        self.with_delivery_mode(DeliveryMode::Persistent)
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Message TTL; stored as whole milliseconds
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl.as_millis().to_string());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Per-subscription options
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeConfig {
    /// Queue (AMQP) or consumer group (long-poll) name
    pub queue: Option<String>,
    /// Let the backend settle deliveries; the layer never acks or nacks
    pub auto_ack: bool,
    /// Explicitly ack after a successful handler run
    pub ack_on_success: bool,
    pub durable_queue: bool,
    /// Requeue flag passed to nack after a handler error
    pub requeue_on_error: bool,
    /// Queue declaration arguments
    pub queue_args: HashMap<String, serde_json::Value>,
    /// Extra arguments for the queue binding
    pub bind_headers: HashMap<String, serde_json::Value>,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            queue: None,
            auto_ack: true,
            ack_on_success: false,
            durable_queue: false,
            requeue_on_error: false,
            queue_args: HashMap::new(),
            bind_headers: HashMap::new(),
        }
    }
}

impl SubscribeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Ack after a successful handler run; turns auto-ack off
    pub fn ack_on_success(mut self) -> Self {
        self.ack_on_success = true;
        self.auto_ack = false;
        self
    }

    pub fn durable_queue(mut self) -> Self {
        self.durable_queue = true;
        self
    }

    pub fn requeue_on_error(mut self) -> Self {
        self.requeue_on_error = true;
        self
    }

    pub fn with_queue_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.queue_args.insert(key.into(), value);
        self
    }

    pub fn with_bind_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.bind_headers.insert(key.into(), value);
        self
    }
}

/// TLS client settings handed to the transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Server name to verify instead of the address host
    pub domain: Option<String>,
}

/// Authentication material
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    /// Username/password (AMQP PLAIN)
    Plain { username: String, password: String },
    /// Access key pair for HTTP queue services
    AccessKey {
        access_key: String,
        secret_key: String,
        #[serde(default)]
        security_token: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::AccessKey { access_key, .. } => f
                .debug_struct("AccessKey")
                .field("access_key", access_key)
                .field("secret_key", &"<redacted>")
                .finish(),
        }
    }
}

/// Exchange the AMQP adapter publishes to and binds queues on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub name: String,
    pub durable: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_EXCHANGE.to_string(),
            durable: false,
        }
    }
}

/// Settings of the bounded long-poll delivery loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongPollSettings {
    /// Backend instance identifier
    pub instance: Option<String>,
    /// Namespace prefixed to topics by some services
    pub namespace: Option<String>,
    /// Consumer group used when a subscription names none
    pub default_group: Option<String>,
    pub batch_size: usize,
    pub poll_wait: Duration,
    pub local_timeout: Duration,
    pub error_cooldown: Duration,
}

impl Default for LongPollSettings {
    fn default() -> Self {
        Self {
            instance: None,
            namespace: None,
            default_group: None,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_wait: DEFAULT_POLL_WAIT,
            local_timeout: DEFAULT_LOCAL_TIMEOUT,
            error_cooldown: DEFAULT_ERROR_COOLDOWN,
        }
    }
}

impl LongPollSettings {
    /// Batch size clamped into the range the backend accepts
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    /// Local timeout, raised above the poll wait when configured too low
    pub fn effective_local_timeout(&self) -> Duration {
        if self.local_timeout > self.poll_wait {
            self.local_timeout
        } else {
            self.poll_wait.saturating_add(Duration::from_secs(1))
        }
    }
}

/// Broker-wide options
#[derive(Clone, Default)]
pub struct BrokerOptions {
    pub addresses: Vec<String>,
    pub secure: bool,
    pub tls: Option<TlsConfig>,
    pub credentials: Option<Credentials>,
    /// Payload codec applied to delivered bodies
    pub codec: Option<Arc<dyn Codec>>,
    pub exchange: ExchangeConfig,
    pub prefetch_count: u16,
    pub prefetch_global: bool,
    pub long_poll: LongPollSettings,
    pub backoff: BackoffConfig,
    /// Connection name reported to the broker
    pub connection_name: Option<String>,
}

impl fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("addresses", &self.addresses)
            .field("secure", &self.secure)
            .field("tls", &self.tls)
            .field("credentials", &self.credentials)
            .field("codec", &self.codec.as_ref().map(|c| c.name()))
            .field("exchange", &self.exchange)
            .field("prefetch_count", &self.prefetch_count)
            .field("prefetch_global", &self.prefetch_global)
            .field("long_poll", &self.long_poll)
            .field("backoff", &self.backoff)
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

impl BrokerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self.secure = true;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_exchange(mut self, name: impl Into<String>, durable: bool) -> Self {
        self.exchange = ExchangeConfig {
            name: name.into(),
            durable,
        };
        self
    }

    pub fn with_prefetch(mut self, count: u16, global: bool) -> Self {
        self.prefetch_count = count;
        self.prefetch_global = global;
        self
    }

    pub fn with_long_poll(mut self, settings: LongPollSettings) -> Self {
        self.long_poll = settings;
        self
    }

    pub fn with_default_group(mut self, group: impl Into<String>) -> Self {
        self.long_poll.default_group = Some(group.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.long_poll.instance = Some(instance.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// First configured address, if any
    pub fn primary_address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}
