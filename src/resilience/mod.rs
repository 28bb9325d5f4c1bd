//! # Resilience Module
//!
//! Connection-level fault tolerance shared by every broker adapter.
//!
//! ## Architecture
//!
//! - **Backoff**: capped exponential retry delays with reset on success
//! - **Connectivity**: observable connected/shutdown/epoch state broadcast to subscribers
//! - **Connection Manager**: owns the transport link, detects loss and redials
//! - **In-Flight Tracking**: wait-group of executing handlers, drained by `disconnect()`
//!
//! ## Usage
//!
//! ```rust
//! use queue_bridge::resilience::{BackoffConfig, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! ```

pub mod backoff;
pub mod connection_manager;
pub mod connectivity;
pub mod inflight;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use connection_manager::{ConnectionManager, Dialer, LinkSlot, SlotResources, TransportLink};
pub use connectivity::{ConnectionState, ConnectivityWatch, LinkStatus, WaitOutcome};
pub use inflight::{InFlightGuard, InFlightTracker};
