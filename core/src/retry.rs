use std::time::Duration;

use crate::error::{ErrorKind, JobError};

/// Exponential backoff: wait `base`, then `2 * base`, `4 * base`, ... between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

/// What the executor should do after an attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(JobError),
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay to wait before attempt number `next_attempt` (1-based). The first attempt never waits.
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        if next_attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (next_attempt - 2).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Decide after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, attempt: u32, error: JobError) -> RetryDecision {
        if error.kind == ErrorKind::Transient && attempt < self.max_attempts {
            RetryDecision::RetryAfter(self.delay_before(attempt + 1))
        } else {
            RetryDecision::GiveUp(error)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}
