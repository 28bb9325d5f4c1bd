//! # Long-Poll Transport Seam
//!
//! Vendor-facing traits for HTTP queue services that deliver through bounded
//! long polls and only support acknowledgement by receipt handle. Messages
//! that are not acknowledged become visible again after the service's
//! invisibility window.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::messaging::errors::BrokerResult;
use crate::messaging::message::{MessageId, ReceiptHandle};
use crate::messaging::options::Credentials;
use crate::resilience::TransportLink;

/// Service endpoint and account settings
#[derive(Debug, Clone)]
pub struct PollEndpoint {
    pub url: String,
    pub credentials: Option<Credentials>,
    pub instance: Option<String>,
    pub namespace: Option<String>,
}

/// Creates service clients
#[async_trait]
pub trait PollConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &PollEndpoint) -> BrokerResult<Arc<dyn PollClient>>;
}

/// A service client; hands out per-topic producers and consumers
#[async_trait]
pub trait PollClient: TransportLink {
    async fn producer(&self, topic: &str) -> BrokerResult<Arc<dyn TopicProducer>>;

    async fn consumer(&self, topic: &str, group: &str) -> BrokerResult<Arc<dyn TopicConsumer>>;
}

/// Publishes to one topic
#[async_trait]
pub trait TopicProducer: Send + Sync + 'static {
    async fn publish(
        &self,
        body: Vec<u8>,
        properties: HashMap<String, String>,
    ) -> BrokerResult<MessageId>;
}

/// One message returned by a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledMessage {
    pub message_id: MessageId,
    pub receipt: ReceiptHandle,
    pub body: Vec<u8>,
    pub properties: HashMap<String, String>,
    /// How many times the service has handed this message out
    pub consumed_times: u32,
}

/// Poll outcomes other than a batch
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    /// Nothing arrived within the poll wait; not a failure
    #[error("no messages available")]
    NoMessages,
    #[error("{0}")]
    Backend(String),
}

/// One receipt the service refused to acknowledge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFailureItem {
    pub receipt: ReceiptHandle,
    pub code: String,
    pub message: String,
}

/// Acknowledgement failure, with per-receipt detail when the service gives it
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("ack failed: {message}")]
pub struct AckFailure {
    pub message: String,
    pub items: Vec<AckFailureItem>,
}

/// Consumes one topic within one consumer group
#[async_trait]
pub trait TopicConsumer: Send + Sync + 'static {
    /// Wait up to `wait` server-side for at most `max` messages
    async fn poll(&self, max: usize, wait: Duration) -> Result<Vec<PolledMessage>, PollError>;

    async fn ack(&self, receipts: &[ReceiptHandle]) -> Result<(), AckFailure>;

    /// Release client-side resources
    async fn close(&self) -> BrokerResult<()> {
        Ok(())
    }
}
