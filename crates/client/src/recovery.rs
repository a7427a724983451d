//! Reconnect backoff.
//!
//! Delays grow as `base * 2^attempt` capped at `max_delay`, with full jitter
//! so a pool of relays dropped by the same network blip does not reconnect
//! in lockstep.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff schedule for one relay's reconnect loop.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    /// `None` means retry forever.
    max_attempts: Option<u32>,
    jittered: bool,
    attempt: u32,
}

impl ExponentialBackoff {
    /// `max_attempts` of 0 means unlimited.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            jittered: true,
            attempt: 0,
        }
    }

    /// Disable jitter, mainly for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jittered = false;
        self
    }

    /// Next delay in the schedule, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let base_ms = self.base_delay.as_millis() as u128;
        let max_ms = self.max_delay.as_millis() as u128;
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        let delay_ms = if self.jittered {
            let capped = capped_ms.min(u64::MAX as u128) as u64;
            rand::rng().random_range(0..=capped)
        } else {
            capped_ms.min(u64::MAX as u128) as u64
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(delay_ms))
    }

    /// Clear the attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0)
    }
}
