//! Bounded exponential backoff policy.
//!
//! The policy is pure data: it decides how many attempts an operation gets,
//! how long to wait before each retry, and which failure kinds are eligible.
//! Execution lives in [`crate::retry`].

use std::time::Duration;

use super::types::FailureKind;

/// Which failures the retry executor may retry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Retryable {
    /// Every failure is retried, including unclassified ones.
    #[default]
    Any,
    /// Only failures classified as one of these kinds are retried.
    Kinds(Vec<FailureKind>),
}

impl Retryable {
    /// Only network/timeout-class failures.
    pub fn transient() -> Self {
        Retryable::Kinds(vec![
            FailureKind::Network,
            FailureKind::Timeout,
            FailureKind::RateLimited,
            FailureKind::Unavailable,
        ])
    }

    pub fn allows(&self, kind: Option<FailureKind>) -> bool {
        match self {
            Retryable::Any => true,
            Retryable::Kinds(kinds) => kind.is_some_and(|kind| kinds.contains(&kind)),
        }
    }
}

/// Retry budget and delay schedule.
///
/// An operation gets `max_retries + 1` attempts. The delay before retry `k`
/// (1-indexed) is `base_delay * backoff_factor^(k-1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub retryable: Retryable,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            retryable: Retryable::Any,
        }
    }
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay slept before retry number `retry` (1-indexed).
    ///
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// The full delay schedule, one entry per retry.
    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.max_retries)
            .map(|retry| self.delay_before_retry(retry))
            .collect()
    }
}
