//! # Broker Capability
//!
//! The backend-agnostic publish/subscribe facade implemented by every adapter.

use async_trait::async_trait;
use std::sync::Arc;

use super::errors::BrokerResult;
use super::handler::Handler;
use super::message::Message;
use super::options::{BrokerOptions, PublishConfig, SubscribeConfig};
use super::subscriber::Subscription;

/// Publish/subscribe over one backend
///
/// Only the synchronous calls return errors. Failures inside a subscription's
/// background task are retried or logged and never reach the caller.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Primary endpoint address
    fn address(&self) -> String;

    /// Snapshot of the current options
    fn options(&self) -> BrokerOptions;

    /// Replace the options. Rejected once the broker has connected.
    async fn init(&self, options: BrokerOptions) -> BrokerResult<()>;

    /// Establish the transport. Idempotent while connected.
    async fn connect(&self) -> BrokerResult<()>;

    /// Retire the broker: stop reconnecting, wake blocked subscribers, tear
    /// down the transport and wait for executing handlers to finish.
    async fn disconnect(&self) -> BrokerResult<()>;

    /// Send one message to `topic`
    async fn publish(
        &self,
        topic: &str,
        message: Message,
        config: PublishConfig,
    ) -> BrokerResult<()>;

    /// Start a background subscription on `topic`
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        config: SubscribeConfig,
    ) -> BrokerResult<Subscription>;
}
