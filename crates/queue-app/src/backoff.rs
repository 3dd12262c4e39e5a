//! Exponential backoff for consecutive fetch failures.
//!
//! The Nth consecutive failure waits `min(base * 2^(N-1), cap)`, without
//! jitter. A successful fetch resets the count.

use crate::config::BackoffConfig;
use std::time::Duration;

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;

/// Backoff schedule with a fatal consecutive-failure ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_failures: u32) -> Self {
        Self {
            base,
            cap,
            max_failures,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_consecutive_failures,
        )
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    ///
    /// Zero failures means no delay.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Whether `failures` consecutive failures end the loop
    pub fn is_fatal(&self, failures: u32) -> bool {
        failures >= self.max_failures
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
