//! # Connection Manager
//!
//! Owns the single transport link of one broker instance, detects its loss and
//! re-establishes it with capped exponential backoff.
//!
//! ## Lifecycle
//!
//! ```text
//! connect() ──dial ok──> Connected(epoch n) ──link closed──> Reconnecting
//!     │                        ▲                                  │
//!     └──dial err──> Err       └──────────── dial ok (epoch n+1) ─┘
//!
//! disconnect() ──> Shutdown (permanent, from any state)
//! ```
//!
//! The link and any per-link resources (for example a producer cache) live in
//! one [`LinkSlot`] behind a single coarse `tokio::sync::Mutex`. Connect,
//! reconnect and producer/consumer acquisition are rare compared to steady
//! traffic, so one lock is enough.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::{BackoffConfig, ExponentialBackoff};
use super::connectivity::{ConnectionState, ConnectivityWatch};
use crate::messaging::errors::{BrokerError, BrokerResult};

/// A live transport handle
#[async_trait]
pub trait TransportLink: Send + Sync + 'static {
    /// Resolve when the link drops without being asked to, with a reason.
    ///
    /// Stateless transports never resolve.
    async fn closed(&self) -> String {
        futures::future::pending::<String>().await
    }

    /// Tear the link down
    async fn close(&self) -> BrokerResult<()>;
}

/// Produces transport links for a connection manager
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Link: TransportLink + ?Sized;

    /// Establish a new link
    async fn dial(&self) -> BrokerResult<Arc<Self::Link>>;

    /// Human readable endpoint for logs
    fn endpoint(&self) -> String;

    /// Backoff applied between redial attempts
    fn backoff(&self) -> BackoffConfig {
        BackoffConfig::default()
    }
}

/// Per-link resources stored next to the link
pub trait SlotResources: Default + Send + 'static {
    /// Drop anything created from a link that is gone
    fn reset(&mut self) {}
}

impl SlotResources for () {}

/// The link plus its resources, guarded by the manager's lock
#[derive(Debug)]
pub struct LinkSlot<L: ?Sized, R> {
    link: Option<Arc<L>>,
    pub resources: R,
}

impl<L: ?Sized, R> LinkSlot<L, R> {
    pub fn link(&self) -> Option<Arc<L>> {
        self.link.clone()
    }

    /// The live link, or a connection error naming the operation
    pub fn require_link(&self, operation: &str) -> BrokerResult<Arc<L>> {
        self.link.clone().ok_or_else(|| {
            BrokerError::connection(format!("no live connection for {}", operation))
        })
    }
}

/// Connection/reconnect manager for one broker
pub struct ConnectionManager<D: Dialer, R: SlotResources = ()> {
    name: &'static str,
    dialer: D,
    slot: Mutex<LinkSlot<D::Link, R>>,
    state: ConnectionState,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<D: Dialer, R: SlotResources> std::fmt::Debug for ConnectionManager<D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name)
            .field("endpoint", &self.dialer.endpoint())
            .field("status", &self.state.snapshot())
            .field("has_watcher", &self.watcher.lock().is_some())
            .finish()
    }
}

impl<D: Dialer, R: SlotResources> ConnectionManager<D, R> {
    pub fn new(name: &'static str, dialer: D) -> Self {
        Self {
            name,
            dialer,
            slot: Mutex::new(LinkSlot {
                link: None,
                resources: R::default(),
            }),
            state: ConnectionState::new(),
            watcher: parking_lot::Mutex::new(None),
        }
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn watch(&self) -> ConnectivityWatch {
        self.state.watch()
    }

    /// Acquire the shared lock over the link and its resources
    pub async fn lock(&self) -> MutexGuard<'_, LinkSlot<D::Link, R>> {
        self.slot.lock().await
    }

    /// Establish the link and start the watcher. Idempotent while connected.
    ///
    /// Dial failures are returned to the caller; only the watcher retries.
    pub async fn connect(self: &Arc<Self>) -> BrokerResult<()> {
        if self.state.is_shutdown() {
            return Err(BrokerError::Shutdown);
        }

        let mut slot = self.slot.lock().await;
        if slot.link.is_some() {
            debug!(broker = self.name, "Connect called while already connected");
            return Ok(());
        }

        let link = self.dialer.dial().await.map_err(|e| match e {
            BrokerError::Connection { .. } => e,
            other => BrokerError::connection(other.to_string()),
        })?;

        if self.state.is_shutdown() {
            drop(slot);
            let _ = link.close().await;
            return Err(BrokerError::Shutdown);
        }

        slot.resources.reset();
        slot.link = Some(link);
        drop(slot);

        let epoch = self.state.mark_connected();
        info!(
            broker = self.name,
            endpoint = %self.dialer.endpoint(),
            epoch = ?epoch,
            "🔌 Broker connected"
        );

        self.ensure_watcher();
        Ok(())
    }

    /// Retire the manager: set shutdown, tear down the link, stop the watcher
    pub async fn disconnect(&self) -> BrokerResult<()> {
        self.state.shutdown();

        let link = {
            let mut slot = self.slot.lock().await;
            slot.resources.reset();
            slot.link.take()
        };

        let result = match link {
            Some(link) => link.close().await,
            None => Ok(()),
        };

        let watcher = self.watcher.lock().take();
        if let Some(handle) = watcher {
            if let Err(e) = handle.await {
                warn!(broker = self.name, error = %e, "Connection watcher ended abnormally");
            }
        }

        info!(broker = self.name, "🔌 Broker disconnected");
        result
    }

    fn ensure_watcher(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock();
        let running = watcher.as_ref().is_some_and(|handle| !handle.is_finished());
        if running {
            return;
        }
        let manager = Arc::clone(self);
        *watcher = Some(tokio::spawn(async move { manager.watch_link().await }));
    }

    async fn watch_link(self: Arc<Self>) {
        let mut shutdown = self.state.watch();
        let mut backoff = ExponentialBackoff::new(self.dialer.backoff());

        loop {
            if self.state.is_shutdown() {
                break;
            }

            let current = self.slot.lock().await.link();
            let Some(link) = current else {
                if !self.redial(&mut backoff, &mut shutdown).await {
                    break;
                }
                continue;
            };

            tokio::select! {
                _ = shutdown.wait_shutdown() => break,
                reason = link.closed() => {
                    if self.state.is_shutdown() {
                        break;
                    }
                    let mut slot = self.slot.lock().await;
                    let same_link = slot
                        .link
                        .as_ref()
                        .is_some_and(|installed| Arc::ptr_eq(installed, &link));
                    if same_link {
                        slot.link = None;
                        slot.resources.reset();
                        drop(slot);
                        self.state.mark_lost();
                        warn!(
                            broker = self.name,
                            endpoint = %self.dialer.endpoint(),
                            reason = %reason,
                            "⚠️ Broker connection lost, reconnecting"
                        );
                    }
                }
            }
        }

        debug!(broker = self.name, "Connection watcher stopped");
    }

    /// Redial until success or shutdown. Returns false on shutdown.
    async fn redial(
        &self,
        backoff: &mut ExponentialBackoff,
        shutdown: &mut ConnectivityWatch,
    ) -> bool {
        loop {
            if self.state.is_shutdown() {
                return false;
            }

            let dialed = tokio::select! {
                _ = shutdown.wait_shutdown() => return false,
                dialed = self.dialer.dial() => dialed,
            };

            match dialed {
                Ok(link) => {
                    let mut slot = self.slot.lock().await;
                    if self.state.is_shutdown() || slot.link.is_some() {
                        // Shut down meanwhile, or connect() already installed a link
                        let shut_down = self.state.is_shutdown();
                        drop(slot);
                        let _ = link.close().await;
                        backoff.reset();
                        return !shut_down;
                    }
                    slot.resources.reset();
                    slot.link = Some(link);
                    drop(slot);

                    let epoch = self.state.mark_connected();
                    info!(
                        broker = self.name,
                        endpoint = %self.dialer.endpoint(),
                        epoch = ?epoch,
                        attempts = backoff.failures() + 1,
                        "🔌 Broker reconnected"
                    );
                    backoff.reset();
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        broker = self.name,
                        endpoint = %self.dialer.endpoint(),
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    tokio::select! {
                        _ = shutdown.wait_shutdown() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

impl<D: Dialer, R: SlotResources> Drop for ConnectionManager<D, R> {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Debug, Default)]
    struct FakeLink {
        dropped: Notify,
        closed_by_us: AtomicBool,
    }

    #[async_trait]
    impl TransportLink for FakeLink {
        async fn closed(&self) -> String {
            self.dropped.notified().await;
            "peer reset".to_string()
        }

        async fn close(&self) -> BrokerResult<()> {
            self.closed_by_us.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct FakeDialer {
        refuse: AtomicBool,
        dials: AtomicUsize,
        last: parking_lot::Mutex<Option<Arc<FakeLink>>>,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        type Link = FakeLink;

        async fn dial(&self) -> BrokerResult<Arc<FakeLink>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(BrokerError::connection("refused"));
            }
            let link = Arc::new(FakeLink::default());
            *self.last.lock() = Some(Arc::clone(&link));
            Ok(link)
        }

        fn endpoint(&self) -> String {
            "fake://broker".to_string()
        }

        fn backoff(&self) -> BackoffConfig {
            BackoffConfig {
                initial_delay_ms: 5,
                multiplier: 2,
                max_delay_ms: 20,
            }
        }
    }

    async fn wait_for_epoch(manager: &ConnectionManager<FakeDialer>, epoch: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.state().epoch() < epoch || !manager.state().is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("manager should reach epoch");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let manager = Arc::new(ConnectionManager::<FakeDialer>::new("fake", FakeDialer::default()));
        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(manager.dialer().dials.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().epoch(), 1);
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_surfaced() {
        let dialer = FakeDialer::default();
        dialer.refuse.store(true, Ordering::SeqCst);
        let manager = Arc::new(ConnectionManager::<FakeDialer>::new("fake", dialer));

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, BrokerError::Connection { .. }));
        assert!(!manager.state().has_connected());
    }

    #[tokio::test]
    async fn test_watcher_reconnects_after_loss() {
        let manager = Arc::new(ConnectionManager::<FakeDialer>::new("fake", FakeDialer::default()));
        manager.connect().await.unwrap();

        manager.dialer().refuse.store(true, Ordering::SeqCst);
        let first = manager.dialer().last.lock().clone().unwrap();
        first.dropped.notify_one();

        tokio::time::timeout(Duration::from_secs(1), async {
            while manager.state().is_connected() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert!(manager.lock().await.link().is_none());

        // Let a few redials fail before allowing the next one
        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.dialer().refuse.store(false, Ordering::SeqCst);
        wait_for_epoch(&manager, 2).await;
        assert!(manager.dialer().dials.load(Ordering::SeqCst) >= 3);

        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_permanent() {
        let manager = Arc::new(ConnectionManager::<FakeDialer>::new("fake", FakeDialer::default()));
        manager.connect().await.unwrap();
        let link = manager.dialer().last.lock().clone().unwrap();

        manager.disconnect().await.unwrap();
        assert!(link.closed_by_us.load(Ordering::SeqCst));
        assert!(manager.state().is_shutdown());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, BrokerError::Shutdown));
    }
}
