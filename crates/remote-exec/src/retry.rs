//! Fixed-interval retry policies.

use std::time::Duration;

/// Retry policy: a bounded number of attempts with a fixed delay between
/// consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a fixed delay policy. A zero attempt count is treated as one.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            delay,
        }
    }

    /// Start tracking attempts under this policy.
    #[must_use]
    pub const fn start(self) -> RetryState {
        RetryState::new(self)
    }
}

/// Retry state tracker.
#[derive(Debug)]
pub struct RetryState {
    /// Attempts made so far.
    attempt: u32,
    /// Policy in use.
    policy: RetryPolicy,
    /// Total delay accumulated.
    total_delay: Duration,
}

impl RetryState {
    /// Create new state.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            attempt: 0,
            policy,
            total_delay: Duration::ZERO,
        }
    }

    /// Attempts made so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempts left after the ones already made.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.policy.max_attempts.saturating_sub(self.attempt)
    }

    /// Record an attempt. Returns `false` once the budget is spent.
    pub fn record_attempt(&mut self) -> bool {
        if self.attempt >= self.policy.max_attempts {
            return false;
        }
        self.attempt += 1;
        true
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.attempt < self.policy.max_attempts
    }

    /// Sleep for the policy delay before the next attempt.
    pub async fn backoff(&mut self) {
        self.total_delay += self.policy.delay;
        tokio::time::sleep(self.policy.delay).await;
    }

    /// Get total delay so far.
    #[must_use]
    pub const fn total_delay(&self) -> Duration {
        self.total_delay
    }
}
