//! Retry policy for failed messages and transport calls

use event_bus_core::ProcessorConfig;
use std::time::Duration;

/// Retry policy with optional exponential backoff.
///
/// `attempt` counts failures so far, starting at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Same delay before every retry
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Policy used by topic processors
    pub fn from_processor(config: &ProcessorConfig) -> Self {
        Self::fixed(config.max_retries, config.retry_backoff)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let delay = Duration::from_millis(delay as u64);
        std::cmp::min(delay, self.max_delay)
    }
}
