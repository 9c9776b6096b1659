//! Bounded exponential backoff for transient provider and network errors.

use std::time::Duration;

/// Bounded exponential backoff: `max_retries` attempts after the first
/// failure, delays doubling from `base_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl BackoffPolicy {
    /// The transient-error policy: 3 retries at 1s / 2s / 4s.
    pub fn transient() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `retry` (1-based). `None` once the retry
    /// budget is spent.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        Some(self.base_delay * 2u32.saturating_pow(retry - 1))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::transient()
    }
}
