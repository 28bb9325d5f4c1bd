//! # lapin Transport
//!
//! [`AmqpConnector`] over the `lapin` AMQP 0.9.1 client.
//!
//! Each session owns one connection and one publishing channel. Every
//! subscription gets its own channel so closing it ends exactly that consumer.
//! A publishing channel closed by the broker is replaced on the next
//! `reopen_publisher`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::uri::{AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::transport::{
    AmqpConnector, AmqpConsumer, AmqpDelivery, AmqpEndpoint, AmqpSession, ConsumeSpec,
    Publishing,
};
use crate::messaging::errors::{BrokerError, BrokerResult};
use crate::messaging::options::{Credentials, ExchangeConfig, TlsConfig};
use crate::messaging::publication::Acknowledger;
use crate::messaging::subscriber::ConsumerCloser;
use crate::resilience::TransportLink;

/// Dials RabbitMQ (or any AMQP 0.9.1 broker) with lapin
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

fn uri_for(endpoint: &AmqpEndpoint) -> BrokerResult<AMQPUri> {
    let mut uri: AMQPUri = endpoint
        .url
        .parse()
        .map_err(|e: String| BrokerError::configuration("amqp_url", e))?;
    if let Some(Credentials::Plain { username, password }) = &endpoint.credentials {
        uri.authority.userinfo = AMQPUserInfo {
            username: username.clone(),
            password: password.clone(),
        };
    }
    Ok(uri)
}

fn tls_config(tls: &TlsConfig) -> BrokerResult<OwnedTLSConfig> {
    let cert_chain = match &tls.ca_cert_path {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
            BrokerError::configuration("tls", format!("{}: {}", path.display(), e))
        })?),
        None => None,
    };
    // lapin takes client identities as PKCS#12 bundles
    let identity = match &tls.client_cert_path {
        Some(path) => Some(OwnedIdentity {
            der: std::fs::read(path).map_err(|e| {
                BrokerError::configuration("tls", format!("{}: {}", path.display(), e))
            })?,
            password: String::new(),
        }),
        None => None,
    };
    Ok(OwnedTLSConfig {
        identity,
        cert_chain,
    })
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, endpoint: &AmqpEndpoint) -> BrokerResult<Arc<dyn AmqpSession>> {
        let uri = uri_for(endpoint)?;
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &endpoint.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = match &endpoint.tls {
            Some(tls) => {
                Connection::connect_uri_with_config(uri, properties, tls_config(tls)?).await
            }
            None => Connection::connect_uri(uri, properties).await,
        }
        .map_err(|e| BrokerError::connection(format!("AMQP connection failed: {}", e)))?;

        let (lost_tx, lost_rx) = watch::channel(None);
        connection.on_error(move |err| {
            let _ = lost_tx.send(Some(err.to_string()));
        });

        let channel = publishing_channel(&connection, &endpoint.exchange).await?;

        Ok(Arc::new(LapinSession {
            connection,
            publisher: Mutex::new(channel),
            exchange: endpoint.exchange.clone(),
            prefetch_count: endpoint.prefetch_count,
            prefetch_global: endpoint.prefetch_global,
            lost: lost_rx,
        }))
    }
}

/// Open a channel and declare the broker's exchange on it
async fn publishing_channel(
    connection: &Connection,
    exchange: &ExchangeConfig,
) -> BrokerResult<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| BrokerError::connection(format!("AMQP channel creation failed: {}", e)))?;
    channel
        .exchange_declare(
            &exchange.name,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: exchange.durable,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::connection(format!("exchange declare failed: {}", e)))?;
    Ok(channel)
}

struct LapinSession {
    connection: Connection,
    publisher: Mutex<Channel>,
    exchange: ExchangeConfig,
    prefetch_count: u16,
    prefetch_global: bool,
    lost: watch::Receiver<Option<String>>,
}

#[async_trait]
impl TransportLink for LapinSession {
    async fn closed(&self) -> String {
        let mut lost = self.lost.clone();
        let reason = match lost.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection error handler dropped".to_string(),
        };
        reason
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "disconnect")
            .await
            .map_err(|e| BrokerError::connection(format!("AMQP close failed: {}", e)))
    }
}

#[async_trait]
impl AmqpSession for LapinSession {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> BrokerResult<()> {
        let properties = properties_for(&publishing);
        let publisher = self.publisher.lock().await.clone();
        let confirm = publisher
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &publishing.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::publish(routing_key, e.to_string()))?;
        confirm
            .await
            .map_err(|e| BrokerError::publish(routing_key, format!("confirmation failed: {}", e)))?;
        Ok(())
    }

    async fn reopen_publisher(&self) -> BrokerResult<()> {
        let mut publisher = self.publisher.lock().await;
        if publisher.status().connected() {
            return Ok(());
        }
        if !self.connection.status().connected() {
            return Err(BrokerError::connection("AMQP connection closed"));
        }
        *publisher = publishing_channel(&self.connection, &self.exchange).await?;
        debug!(exchange = %self.exchange.name, "AMQP publishing channel reopened");
        Ok(())
    }

    async fn consume(&self, spec: &ConsumeSpec) -> BrokerResult<AmqpConsumer> {
        let topic = spec.routing_key.as_str();
        let setup = |e: lapin::Error| BrokerError::consume_setup(topic, e.to_string());

        let channel = self.connection.create_channel().await.map_err(setup)?;
        channel
            .basic_qos(
                self.prefetch_count,
                BasicQosOptions {
                    global: self.prefetch_global,
                },
            )
            .await
            .map_err(setup)?;

        let server_named = spec.queue.is_empty();
        let queue = channel
            .queue_declare(
                &spec.queue,
                QueueDeclareOptions {
                    durable: spec.durable_queue,
                    exclusive: server_named,
                    auto_delete: server_named,
                    ..Default::default()
                },
                field_table(&spec.queue_args),
            )
            .await
            .map_err(setup)?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &queue_name,
                &spec.exchange,
                &spec.routing_key,
                QueueBindOptions::default(),
                field_table(&spec.bind_args),
            )
            .await
            .map_err(setup)?;

        let consumer = channel
            .basic_consume(
                &queue_name,
                &spec.consumer_tag,
                BasicConsumeOptions {
                    no_ack: spec.no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(setup)?;

        debug!(queue = %queue_name, routing_key = %spec.routing_key, "AMQP consumer started");

        let deliveries = consumer
            .take_while(|delivery| {
                if let Err(e) = delivery {
                    warn!(error = %e, "AMQP delivery stream failed");
                }
                futures::future::ready(delivery.is_ok())
            })
            .filter_map(|delivery| futures::future::ready(delivery.ok()))
            .map(|delivery| AmqpDelivery {
                routing_key: delivery.routing_key.as_str().to_string(),
                headers: delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(json_headers)
                    .unwrap_or_default(),
                body: delivery.data,
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                acker: Arc::new(LapinAcker {
                    acker: delivery.acker,
                }),
            })
            .boxed();

        Ok(AmqpConsumer {
            deliveries,
            channel: Arc::new(LapinChannel { channel }),
        })
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::nack(requeue, e.to_string()))
    }

    fn provider(&self) -> &'static str {
        "rabbitmq"
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl ConsumerCloser for LapinChannel {
    async fn close(&self) -> BrokerResult<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "unsubscribe")
            .await
            .map_err(|e| BrokerError::connection(format!("channel close failed: {}", e)))
    }
}

fn properties_for(publishing: &Publishing) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(mode) = publishing.delivery_mode {
        properties = properties.with_delivery_mode(mode);
    }
    if let Some(priority) = publishing.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(value) = &publishing.content_type {
        properties = properties.with_content_type(value.as_str().into());
    }
    if let Some(value) = &publishing.content_encoding {
        properties = properties.with_content_encoding(value.as_str().into());
    }
    if let Some(value) = &publishing.correlation_id {
        properties = properties.with_correlation_id(value.as_str().into());
    }
    if let Some(value) = &publishing.reply_to {
        properties = properties.with_reply_to(value.as_str().into());
    }
    if let Some(value) = &publishing.expiration {
        properties = properties.with_expiration(value.as_str().into());
    }
    if let Some(value) = &publishing.message_id {
        properties = properties.with_message_id(value.as_str().into());
    }
    if let Some(value) = publishing.timestamp {
        properties = properties.with_timestamp(value);
    }
    if let Some(value) = &publishing.kind {
        properties = properties.with_kind(value.as_str().into());
    }
    if let Some(value) = &publishing.user_id {
        properties = properties.with_user_id(value.as_str().into());
    }
    if let Some(value) = &publishing.app_id {
        properties = properties.with_app_id(value.as_str().into());
    }

    let mut headers = FieldTable::default();
    for (key, value) in &publishing.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    properties.with_headers(headers)
}

fn field_table(values: &HashMap<String, serde_json::Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        let value = match value {
            serde_json::Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
            serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
            serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => AMQPValue::LongLongInt(i),
                (None, Some(f)) => AMQPValue::Double(f),
                (None, None) => continue,
            },
            _ => continue,
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn json_headers(table: &FieldTable) -> HashMap<String, serde_json::Value> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| Some((key.as_str().to_string(), json_value(value)?)))
        .collect()
}

fn json_value(value: &AMQPValue) -> Option<serde_json::Value> {
    use serde_json::Value;
    Some(match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::Float(n) => Value::from(*n),
        AMQPValue::Double(n) => Value::from(*n),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(_) => Value::Array(Vec::new()),
        AMQPValue::FieldTable(_) => Value::Object(serde_json::Map::new()),
        AMQPValue::DecimalValue(_) | AMQPValue::ByteArray(_) | AMQPValue::Void => return None,
    })
}
