//! # Subscription Handlers
//!
//! A handler's `Ok`/`Err` result is the only signal that steers ack, nack and
//! requeue. Handlers run inline on their subscriber's task, so invocations for
//! one subscription never overlap.

use async_trait::async_trait;
use std::future::Future;

use super::publication::Publication;

/// Processes delivered publications
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, publication: Publication) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Publication) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, publication: Publication) -> anyhow::Result<()> {
        (self)(publication).await
    }
}
