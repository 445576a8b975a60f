//! Reconnection policy and exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::transport::CloseEvent;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether automatic reconnection is enabled at all.
    pub enabled: bool,
    /// Delay before the first reconnection attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Maximum number of reconnection attempts before giving up.
    pub max_retries: u32,
    /// Upper bound of uniform random jitter added to each delay (0 = none).
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 5,
            jitter_ms: 0,
        }
    }
}

impl ReconnectConfig {
    /// Base delay as a `Duration`.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap as a `Duration`.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff delay for the given zero-based attempt, without jitter.
    ///
    /// `min(base * 2^attempt, cap)`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay(), self.max_delay())
    }

    /// Backoff delay with jitter applied, if configured.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter_ms == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..self.jitter_ms);
        delay + Duration::from_millis(extra)
    }

    /// Decide whether a closure should trigger another attempt.
    ///
    /// `attempt` is the number of reconnects already made since the last
    /// successful open.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, close: &CloseEvent) -> bool {
        if !self.enabled || close.is_clean() {
            return false;
        }
        attempt < self.max_retries
    }
}

/// Calculate `min(base * 2^attempt, cap)` without overflowing.
#[must_use]
pub fn calculate_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
    Duration::from_millis(base_ms.saturating_mul(factor)).min(cap)
}

/// Per-connection retry counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    /// Reconnect attempts made since the last successful open.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a scheduled reconnect.
    pub fn increment(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Called on every successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
