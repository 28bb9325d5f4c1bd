//! # Publications
//!
//! A `Publication` is one delivered message handed to a handler. It carries
//! the decoded message, the topic it arrived on, an optional decode error and
//! the backend handle used to settle it.
//!
//! Settlement is recorded so every delivery gets at most one outcome: once the
//! handler acks or nacks, the delivery loop leaves the publication alone.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::errors::{BrokerError, BrokerResult};
use super::message::Message;

/// Backend handle that settles one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> BrokerResult<()>;

    async fn nack(&self, requeue: bool) -> BrokerResult<()>;

    /// Whether the backend can reject deliveries at all
    fn supports_nack(&self) -> bool {
        true
    }

    /// Provider name used in error reports
    fn provider(&self) -> &'static str {
        "broker"
    }
}

struct PublicationInner {
    topic: String,
    message: Message,
    error: Option<BrokerError>,
    acker: Arc<dyn Acknowledger>,
    requeue_on_error: bool,
    settled: AtomicBool,
}

/// One delivered message
#[derive(Clone)]
pub struct Publication {
    inner: Arc<PublicationInner>,
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("topic", &self.inner.topic)
            .field("headers", &self.inner.message.headers)
            .field("body_len", &self.inner.message.body.len())
            .field("error", &self.inner.error)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl Publication {
    pub fn new(
        topic: impl Into<String>,
        message: Message,
        acker: Arc<dyn Acknowledger>,
        requeue_on_error: bool,
    ) -> Self {
        Self {
            inner: Arc::new(PublicationInner {
                topic: topic.into(),
                message,
                error: None,
                acker,
                requeue_on_error,
                settled: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a decode error; only valid before the publication is shared
    pub(crate) fn with_error(self, error: Option<BrokerError>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.error = error;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    /// Decode error raised while building this publication, if any
    pub fn error(&self) -> Option<&BrokerError> {
        self.inner.error.as_ref()
    }

    /// Whether ack or nack already went through for this delivery
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    /// Acknowledge the delivery. A second call is a no-op.
    pub async fn ack(&self) -> BrokerResult<()> {
        if self.claim() {
            return Ok(());
        }
        let result = self.inner.acker.ack().await;
        if result.is_err() {
            self.inner.settled.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Reject the delivery, requeueing per the subscription's requeue-on-error
    pub async fn nack(&self) -> BrokerResult<()> {
        self.nack_with(self.inner.requeue_on_error).await
    }

    /// Reject the delivery with an explicit requeue flag
    pub async fn nack_with(&self, requeue: bool) -> BrokerResult<()> {
        if !self.inner.acker.supports_nack() {
            return Err(BrokerError::unsupported(self.inner.acker.provider(), "nack"));
        }
        if self.claim() {
            return Ok(());
        }
        let result = self.inner.acker.nack(requeue).await;
        if result.is_err() {
            self.inner.settled.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Mark settled; returns true when it already was
    fn claim(&self) -> bool {
        self.inner.settled.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<String>>,
        nackable: bool,
        fail: bool,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> BrokerResult<()> {
            self.calls.lock().push("ack".into());
            if self.fail {
                return Err(BrokerError::ack("channel closed"));
            }
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> BrokerResult<()> {
            self.calls.lock().push(format!("nack:{requeue}"));
            Ok(())
        }

        fn supports_nack(&self) -> bool {
            self.nackable
        }
    }

    #[tokio::test]
    async fn test_ack_is_recorded_once() {
        let acker = Arc::new(RecordingAcker {
            nackable: true,
            ..Default::default()
        });
        let publication = Publication::new("orders", Message::new("o-1"), acker.clone(), false);

        publication.ack().await.unwrap();
        publication.ack().await.unwrap();
        publication.nack().await.unwrap();

        assert!(publication.is_settled());
        assert_eq!(*acker.calls.lock(), vec!["ack".to_string()]);
    }

    #[tokio::test]
    async fn test_nack_uses_requeue_on_error() {
        let acker = Arc::new(RecordingAcker {
            nackable: true,
            ..Default::default()
        });
        let publication = Publication::new("orders", Message::new("o-1"), acker.clone(), true);

        publication.nack().await.unwrap();
        assert_eq!(*acker.calls.lock(), vec!["nack:true".to_string()]);
    }

    #[tokio::test]
    async fn test_nack_unsupported_on_ack_only_backend() {
        let acker = Arc::new(RecordingAcker::default());
        let publication = Publication::new("orders", Message::new("o-1"), acker.clone(), true);

        let err = publication.nack().await.unwrap_err();
        assert!(matches!(err, BrokerError::Unsupported { .. }));
        assert!(!publication.is_settled());
        assert!(acker.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_ack_leaves_publication_unsettled() {
        let acker = Arc::new(RecordingAcker {
            fail: true,
            ..Default::default()
        });
        let publication = Publication::new("orders", Message::new("o-1"), acker, false);

        assert!(publication.ack().await.is_err());
        assert!(!publication.is_settled());
    }

    #[test]
    fn test_decode_error_is_attached() {
        let acker = Arc::new(RecordingAcker::default());
        let publication = Publication::new("orders", Message::new("garbage"), acker, false)
            .with_error(Some(BrokerError::delivery_decode("orders", "invalid JSON")));

        assert!(matches!(
            publication.error(),
            Some(BrokerError::DeliveryDecode { .. })
        ));
        assert_eq!(publication.message().body, b"garbage");
    }
}
