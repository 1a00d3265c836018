//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure reconnect attempts.
use std::time;

use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
/// How many times a component reconnects after a failed attempt, and how long it waits in between.
pub struct RetryPolicy {
    /// Number of reconnect attempts after the first one. Zero disables reconnecting.
    pub retries: u32,
    /// The wait before the first retry. Never applied before the first attempt.
    pub retry_wait: time::Duration,
    /// Coefficient to multiply retry_wait with for every past retry.
    pub backoff_coefficient: u32,
    /// The maximum possible wait between attempts.
    pub maximum_wait: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(retries: u32, retry_wait: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(retries, retry_wait)
    }

    /// Determine the wait before the given retry, counting from 1.
    pub fn wait_before(&self, retry: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .checked_pow(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let candidate = self
            .retry_wait
            .checked_mul(factor)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_wait {
            Some(maximum) => std::cmp::min(candidate, maximum),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub retries: u32,
    pub retry_wait: time::Duration,
    pub backoff_coefficient: u32,
    pub maximum_wait: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            retries: 0,
            retry_wait: time::Duration::from_secs(1),
            backoff_coefficient: 1,
            maximum_wait: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(retries: u32, retry_wait: time::Duration) -> Self {
        Self {
            retries,
            retry_wait,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn backoff_coefficient(mut self, coefficient: u32) -> RetryPolicyBuilder {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn maximum_wait(mut self, wait: time::Duration) -> RetryPolicyBuilder {
        self.maximum_wait = Some(wait);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            retry_wait: self.retry_wait,
            backoff_coefficient: self.backoff_coefficient,
            maximum_wait: self.maximum_wait,
        }
    }
}

/// Retries spent by a running component.
#[derive(Debug)]
pub(crate) struct RetryBudget<'p> {
    policy: &'p RetryPolicy,
    used: u32,
}

impl<'p> RetryBudget<'p> {
    pub(crate) fn new(policy: &'p RetryPolicy) -> Self {
        Self { policy, used: 0 }
    }

    pub(crate) fn used(&self) -> u32 {
        self.used
    }

    /// Forget previous failures, after an attempt made progress.
    pub(crate) fn reset(&mut self) {
        self.used = 0;
    }

    /// Spend one retry and return the wait before it, or `None` once exhausted.
    pub(crate) fn next_wait(&mut self) -> Option<time::Duration> {
        if self.used >= self.policy.retries {
            return None;
        }
        self.used += 1;
        Some(self.policy.wait_before(self.used))
    }
}

/// Sleep for `wait` unless `shutdown` fires first. Returns false when cancelled.
pub(crate) async fn sleep_or_cancel(wait: time::Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_retry_wait() {
        let retry_policy = RetryPolicy::build(3, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.wait_before(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.wait_before(2), time::Duration::from_secs(2));
        assert_eq!(retry_policy.wait_before(3), time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_wait_increases_with_coefficient() {
        let retry_policy = RetryPolicy::build(3, time::Duration::from_secs(2))
            .backoff_coefficient(2)
            .provide();

        assert_eq!(retry_policy.wait_before(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.wait_before(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.wait_before(3), time::Duration::from_secs(8));
    }

    #[test]
    fn test_retry_wait_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(4, time::Duration::from_secs(2))
            .backoff_coefficient(2)
            .maximum_wait(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.wait_before(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.wait_before(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.wait_before(3), time::Duration::from_secs(4));
        assert_eq!(retry_policy.wait_before(40), time::Duration::from_secs(4));
    }

    #[test]
    fn test_budget_allows_exactly_retries() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(10)).provide();
        let mut budget = RetryBudget::new(&retry_policy);

        assert_eq!(budget.next_wait(), Some(time::Duration::from_millis(10)));
        assert_eq!(budget.next_wait(), Some(time::Duration::from_millis(10)));
        assert_eq!(budget.next_wait(), None);
        assert_eq!(budget.used(), 2);

        budget.reset();
        assert_eq!(budget.used(), 0);
        assert!(budget.next_wait().is_some());
    }

    #[test]
    fn test_zero_retries_never_waits() {
        let retry_policy = RetryPolicy::default();
        let mut budget = RetryBudget::new(&retry_policy);

        assert_eq!(budget.next_wait(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let shutdown = CancellationToken::new();
        assert!(sleep_or_cancel(time::Duration::from_secs(5), &shutdown).await);

        shutdown.cancel();
        assert!(!sleep_or_cancel(time::Duration::from_secs(5), &shutdown).await);
    }
}
