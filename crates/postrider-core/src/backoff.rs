//! Retry backoff policy
//!
//! Pure and stateless: the attempt number is always passed in, never stored.
//! Delays grow exponentially from a base, are capped, and carry uniform
//! random jitter so a burst of failing recipients does not retry in
//! lockstep.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSchedule {
    /// Base delay in seconds.
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    /// Cap on the delay in seconds.
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,

    /// Jitter fraction; the delay is scaled by a uniform draw from
    /// `[1 - jitter, 1 + jitter]`.
    #[serde(default = "defaults::jitter_fraction")]
    pub jitter_fraction: f64,

    /// Maximum transmission attempts per recipient.
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            jitter_fraction: defaults::jitter_fraction(),
            max_attempts: defaults::max_attempts(),
        }
    }
}

mod defaults {
    pub const fn base_delay_secs() -> u64 {
        10
    }

    pub const fn max_delay_secs() -> u64 {
        300
    }

    pub const fn jitter_fraction() -> f64 {
        0.25
    }

    pub const fn max_attempts() -> u32 {
        3
    }
}

impl BackoffSchedule {
    /// Whether another attempt may follow the given 1-based attempt.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based), without
    /// jitter: `min(max, base * 2^(attempt - 1))`. Attempt 1 itself is sent
    /// immediately; this is the wait after it fails.
    #[must_use]
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let secs = self
            .base_delay_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// Jittered delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter_fraction <= 0.0 {
            return raw;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.jitter_fraction..=1.0 + self.jitter_fraction);
        raw.mul_f64(factor)
    }
}
