//! Retry delays
//!
//! Outbound connects back off exponentially with random jitter so several
//! devices do not hammer the controller in lockstep. Binding the listening
//! port backs off linearly since only this process competes for it.

use std::time::Duration;

use rand::Rng;

use crate::config::CoreConfig;

/// Largest exponent applied to the base delay
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_jitter: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_jitter: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_jitter,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(
            config.retry_base_delay,
            config.retry_max_jitter,
            config.max_retry_attempts,
        )
    }

    /// `base * 2^(attempt-1)`, attempts counted from 1
    pub fn exponential_base(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Exponential delay plus random jitter in `[0, max_jitter]`
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        self.exponential_base(attempt) + self.jitter()
    }

    /// `base * attempt`
    pub fn linear_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1))
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}
