//! Recording handlers and timing helpers

use queue_bridge::messaging::{Handler, Publication, SubscriberState, Subscription};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Handler that forwards every publication to a channel and returns `Ok`
pub fn recording_handler() -> (Arc<dyn Handler>, mpsc::UnboundedReceiver<Publication>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn Handler> = Arc::new(move |publication: Publication| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(publication);
            anyhow::Ok(())
        }
    });
    (handler, rx)
}

/// Handler that forwards every publication and then fails
pub fn failing_handler() -> (Arc<dyn Handler>, mpsc::UnboundedReceiver<Publication>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn Handler> = Arc::new(move |publication: Publication| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(publication);
            Err::<(), _>(anyhow::anyhow!("payment service unavailable"))
        }
    });
    (handler, rx)
}

/// Next publication, or `None` if nothing arrives within `within`
pub async fn recv_within(
    rx: &mut mpsc::UnboundedReceiver<Publication>,
    within: Duration,
) -> Option<Publication> {
    tokio::time::timeout(within, rx.recv()).await.ok().flatten()
}

/// Next publication's body as text; panics if nothing arrives in time
pub async fn next_body(rx: &mut mpsc::UnboundedReceiver<Publication>) -> String {
    let publication = recv_within(rx, WAIT)
        .await
        .expect("no publication delivered in time");
    publication
        .message()
        .body_str()
        .expect("body is not UTF-8")
        .to_string()
}

pub async fn wait_for_consuming(subscription: &Subscription) {
    tokio::time::timeout(
        WAIT,
        subscription.wait_for_state(|state| state == SubscriberState::Consuming),
    )
    .await
    .expect("subscription never reached Consuming");
}

/// Poll `condition` until it holds; panics after `WAIT`
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {WAIT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
