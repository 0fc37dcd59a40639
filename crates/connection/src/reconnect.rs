//! Reconnect backoff policy.

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Bounded, linearly growing reconnect schedule.
///
/// Round `k` (1-based) waits `initial + (k - 1) * step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    initial_delay: Duration,
    step: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, step: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            initial_delay,
            step,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.reconnect.max_attempts,
            config.reconnect_initial_delay(),
            config.reconnect_delay_step(),
        )
    }

    /// Rounds started since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Start the next round and return its delay, or `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.initial_delay + self.step * self.attempt;
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
