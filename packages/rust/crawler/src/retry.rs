//! Bounded exponential backoff as an explicit state machine.

use std::time::Duration;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// State for a fresh request whose first attempt is about to run.
    pub fn start(&self) -> RetryState {
        RetryState {
            policy: self.clone(),
            attempt: 1,
        }
    }
}

/// Retry progress for one URL.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    /// 1-based number of the attempt in progress.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Called after a transient failure. Returns how long to wait before the
    /// next attempt, or `None` when attempts are exhausted or the server asked
    /// for a wait longer than the backoff ceiling.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }

        let exp = self.attempt.saturating_sub(1).min(16);
        let backoff = self
            .policy
            .base
            .saturating_mul(1u32 << exp)
            .min(self.policy.max);

        let delay = match retry_after {
            Some(hint) if hint > self.policy.max => return None,
            Some(hint) => backoff.max(hint),
            None => backoff,
        };

        self.attempt += 1;
        Some(delay)
    }
}
