//! # Connectivity State
//!
//! Observable connection state shared between a broker's connection manager
//! and its subscribers.
//!
//! The state is a single `watch` value carrying the `connected` flag, the
//! permanent `shutdown` flag, and an epoch counter bumped on every successful
//! (re)connect. Waiters see every transition; nothing is recreated per epoch.

use tokio::sync::watch;

/// Snapshot of a broker's connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    /// Number of successful (re)connects so far
    pub epoch: u64,
    /// Whether a live transport link is installed right now
    pub connected: bool,
    /// Set once by disconnect; never cleared
    pub shutdown: bool,
}

/// Outcome of waiting for connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A live link is installed; carries the current epoch
    Connected(u64),
    /// The broker was disconnected permanently
    Shutdown,
}

/// Writer side of the connectivity state, owned by the connection manager
#[derive(Debug)]
pub struct ConnectionState {
    status: watch::Sender<LinkStatus>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        let (status, _) = watch::channel(LinkStatus::default());
        Self { status }
    }

    /// Record a successful (re)connect and wake every waiter.
    ///
    /// Returns the new epoch, or `None` when the state is already shut down.
    pub fn mark_connected(&self) -> Option<u64> {
        let mut epoch = None;
        self.status.send_if_modified(|status| {
            if status.shutdown {
                return false;
            }
            status.epoch += 1;
            status.connected = true;
            epoch = Some(status.epoch);
            true
        });
        epoch
    }

    /// Record an unexpected loss of the transport
    pub fn mark_lost(&self) {
        self.status.send_if_modified(|status| {
            let changed = status.connected;
            status.connected = false;
            changed
        });
    }

    /// Permanently retire the state. Idempotent.
    pub fn shutdown(&self) {
        self.status.send_if_modified(|status| {
            let changed = !status.shutdown || status.connected;
            status.shutdown = true;
            status.connected = false;
            changed
        });
    }

    pub fn snapshot(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    pub fn is_shutdown(&self) -> bool {
        self.status.borrow().shutdown
    }

    pub fn epoch(&self) -> u64 {
        self.status.borrow().epoch
    }

    /// Whether at least one connect ever succeeded
    pub fn has_connected(&self) -> bool {
        self.status.borrow().epoch > 0
    }

    /// Create a reader for this state
    pub fn watch(&self) -> ConnectivityWatch {
        ConnectivityWatch {
            status: self.status.subscribe(),
        }
    }
}

/// Reader side of the connectivity state
#[derive(Debug, Clone)]
pub struct ConnectivityWatch {
    status: watch::Receiver<LinkStatus>,
}

impl ConnectivityWatch {
    pub fn snapshot(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Wait until a link is installed or the broker shuts down.
    ///
    /// Returns immediately while connected.
    pub async fn wait_connected(&mut self) -> WaitOutcome {
        let status = match self
            .status
            .wait_for(|status| status.connected || status.shutdown)
            .await
        {
            Ok(status) => *status,
            // The manager is gone, which only happens when the broker is dropped
            Err(_) => return WaitOutcome::Shutdown,
        };

        if status.shutdown {
            WaitOutcome::Shutdown
        } else {
            WaitOutcome::Connected(status.epoch)
        }
    }

    /// Resolve once the link installed at `epoch` is gone: lost, replaced or shut down
    pub async fn wait_link_change(&mut self, epoch: u64) {
        let _ = self
            .status
            .wait_for(|status| !status.connected || status.shutdown || status.epoch != epoch)
            .await;
    }

    /// Resolve once the broker shuts down (or the manager is dropped)
    pub async fn wait_shutdown(&mut self) {
        let _ = self.status.wait_for(|status| status.shutdown).await;
    }
}
