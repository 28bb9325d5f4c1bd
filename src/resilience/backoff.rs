//! # Exponential Backoff
//!
//! Capped exponential retry delays shared by the connection watcher and every
//! subscriber's consumer acquisition loop.
//!
//! After `n` consecutive failures the delay is `min(initial * multiplier^(n-1), max)`.
//! Any success resets the sequence back to the initial delay.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BackoffConfig {
    /// Delay after the first failure, in milliseconds
    pub initial_delay_ms: u64,
    /// Growth factor applied after every failure
    pub multiplier: u32,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            multiplier: 2,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay applied after `failures` consecutive failures (1-based).
    ///
    /// Saturates instead of overflowing for large failure counts.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = u64::from(self.multiplier.max(1));
        let mut delay = self.initial_delay_ms;
        for _ in 1..failures {
            delay = delay.saturating_mul(factor);
            if delay >= self.max_delay_ms {
                break;
            }
        }
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Stateful backoff sequence
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_delay().min(config.max_delay()),
            config,
            failures: 0,
        }
    }

    /// Record a failure and return the delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        let grown = self
            .current
            .saturating_mul(self.config.multiplier.max(1));
        self.current = grown.min(self.config.max_delay());
        delay
    }

    /// Record a success; the next failure waits the initial delay again
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay().min(self.config.max_delay());
        self.failures = 0;
    }

    /// Delay the next failure will produce
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_sequence() {
        let mut backoff = ExponentialBackoff::default();
        let delays: Vec<u128> = (0..10).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(
            delays,
            vec![100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 30000]
        );
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.failures(), 11);
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = ExponentialBackoff::default();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_for_attempt_zero() {
        assert_eq!(BackoffConfig::default().delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn test_initial_above_cap_is_clamped() {
        let config = BackoffConfig {
            initial_delay_ms: 50_000,
            multiplier: 2,
            max_delay_ms: 30_000,
        };
        let mut backoff = ExponentialBackoff::new(config);
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn prop_delay_matches_closed_form(failures in 1u32..64) {
            let config = BackoffConfig::default();
            let mut backoff = ExponentialBackoff::new(config);
            let mut last = Duration::ZERO;
            for _ in 0..failures {
                last = backoff.next_delay();
            }
            let exponent = failures - 1;
            let expected_ms = if exponent >= 20 {
                30_000
            } else {
                (100u64 << exponent).min(30_000)
            };
            prop_assert_eq!(last, Duration::from_millis(expected_ms));
            prop_assert_eq!(last, config.delay_for_attempt(failures));
        }

        #[test]
        fn prop_delays_never_decrease_until_reset(
            initial in 1u64..5_000,
            multiplier in 1u32..5,
            cap in 1u64..120_000,
            attempts in 1usize..40,
        ) {
            let mut backoff = ExponentialBackoff::new(BackoffConfig {
                initial_delay_ms: initial,
                multiplier,
                max_delay_ms: cap,
            });
            let mut previous = Duration::ZERO;
            for _ in 0..attempts {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(cap));
                previous = delay;
            }
        }
    }
}
