//! Exponential backoff for idle polling.
//!
//! The relay asks the upstream history for new events in a tight loop while
//! events keep arriving. When a poll comes back empty the loop waits for
//! [`Backoff::next`] before polling again; the first non-empty poll calls
//! [`Backoff::reset`]. The same wait precedes a re-read of events the sink
//! refused.
//!
//! With the default [`BackoffPolicy`] the wait sequence after a reset is
//! `1s, 2s, 4s, 5s, 5s, ...`.

use std::time::Duration;

/// Shape of the backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay returned by the first `next()` after a reset (default: 1s).
    pub min_delay: Duration,
    /// Upper bound for any single delay (default: 5s).
    pub max_delay: Duration,
    /// Multiplier applied per consecutive empty poll (default: 2.0).
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy; `factor` below 1 is raised to 1 and `max_delay`
    /// below `min_delay` is raised to `min_delay`.
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            factor: factor.max(1.0),
        }
    }

    /// `min(max_delay, min_delay * factor^attempt)`, at millisecond resolution.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_millis() as f64;
        let grown = self.min_delay.as_millis() as f64 * self.factor.powi(attempt.min(64) as i32);
        Duration::from_millis(grown.min(cap) as u64)
    }
}

/// Stateful backoff controller driven by the poll loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl Backoff {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay to wait before the next poll; advances the sequence.
    pub fn next(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Restart the sequence at `min_delay`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of consecutive `next()` calls since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
