//! Per-node retry with exponential backoff
//!
//! A node may carry a [`RetryPolicy`]. The engine re-invokes the handler with the same
//! input snapshot until it succeeds or attempts run out; only the final error marks the
//! branch failed.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for a node handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,

    /// Delay before the first retry, in milliseconds
    pub initial_interval_ms: u64,

    /// Multiplier applied to the delay after every retry
    pub backoff_factor: f64,

    /// Upper bound on a single delay, in milliseconds
    pub max_interval_ms: u64,

    /// Scale each delay by a random factor in 0.5..=1.5
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval_ms: 200,
            backoff_factor: 2.0,
            max_interval_ms: 10_000,
            jitter: true,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_interval_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_interval_ms as f64);

        let millis = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };
        Duration::from_millis(millis.max(0.0).round() as u64)
    }

    /// Whether another attempt may follow failed attempt number `attempt` (1-based)
    pub fn allows_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(Duration::from_millis(100))
            .with_backoff_factor(2.0)
            .with_jitter(false);

        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(Duration::from_millis(1000))
            .with_max_interval(Duration::from_millis(1500))
            .with_jitter(false);

        assert_eq!(policy.delay_after(4), Duration::from_millis(1500));
    }

    #[test]
    fn test_jitter_range() {
        let policy = RetryPolicy::new(3).with_initial_interval(Duration::from_millis(400));
        for _ in 0..20 {
            let delay = policy.delay_after(1).as_millis();
            assert!((200..=600).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_allows_retry() {
        let policy = RetryPolicy::new(3);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }
}
