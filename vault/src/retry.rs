//! Bounded retry with exponential backoff.
//!
//! [`retry_with_backoff`] runs an operation up to `max_retries + 1` times,
//! sleeping between attempts through a [`Sleeper`] so tests never block.
//! Failures whose kind the policy does not allow propagate on the first
//! attempt. On exhaustion the last error is returned unchanged.

use std::fmt;
use std::io::ErrorKind;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::backoff::RetryPolicy;
use crate::core::types::FailureKind;

/// A failure tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub kind: FailureKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for ClassifiedError {}

/// Kind of the first classifiable cause in `err`'s chain.
pub fn classify(err: &anyhow::Error) -> Option<FailureKind> {
    err.chain().find_map(|cause| {
        if let Some(classified) = cause.downcast_ref::<ClassifiedError>() {
            return Some(classified.kind);
        }
        cause
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io_failure_kind(io.kind()))
    })
}

fn io_failure_kind(kind: ErrorKind) -> Option<FailureKind> {
    match kind {
        ErrorKind::TimedOut => Some(FailureKind::Timeout),
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => Some(FailureKind::Network),
        _ => None,
    }
}

/// Blocking pause between attempts or poll cycles.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Run `op` under `policy`.
///
/// `op` receives the 1-indexed attempt number. `on_retry` fires once per
/// retry, before the sleep, with the number of the attempt that failed, its
/// error, and the delay about to be slept. It never fires after the final
/// attempt.
pub fn retry_with_backoff<T, S, Op, Obs>(
    policy: &RetryPolicy,
    sleeper: &S,
    mut op: Op,
    mut on_retry: Obs,
) -> Result<T>
where
    S: Sleeper + ?Sized,
    Op: FnMut(u32) -> Result<T>,
    Obs: FnMut(u32, &anyhow::Error, Duration),
{
    let total = policy.total_attempts();
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                let kind = classify(&err);
                if !policy.retryable.allows(kind) {
                    debug!(attempt, kind = ?kind, "failure is not retryable");
                    return Err(err);
                }
                if attempt >= total {
                    return Err(err);
                }
                let delay = policy.delay_before_retry(attempt);
                on_retry(attempt, &err, delay);
                sleeper.sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// [`retry_with_backoff`] that logs each retry with `warn!`.
pub fn retry<T, S, Op>(policy: &RetryPolicy, sleeper: &S, op: Op) -> Result<T>
where
    S: Sleeper + ?Sized,
    Op: FnMut(u32) -> Result<T>,
{
    let max_retries = policy.max_retries;
    retry_with_backoff(policy, sleeper, op, |attempt, err, delay| {
        warn!(
            attempt,
            max_retries,
            delay_secs = delay.as_secs_f64(),
            err = %format!("{err:#}"),
            "attempt failed, retrying"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backoff::Retryable;
    use crate::test_support::RecordingSleeper;
    use anyhow::{Context, anyhow};
    use std::cell::Cell;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn always_failing_op_runs_max_retries_plus_one_times() {
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let mut observed = Vec::new();
        let err = retry_with_backoff(
            &policy(4),
            &sleeper,
            |attempt| -> Result<()> {
                calls.set(calls.get() + 1);
                Err(anyhow!("boom {attempt}"))
            },
            |attempt, err, delay| observed.push((attempt, err.to_string(), delay)),
        )
        .unwrap_err();

        assert_eq!(calls.get(), 5);
        assert_eq!(err.to_string(), "boom 5");
        assert_eq!(
            sleeper.slept(),
            [1, 2, 4, 8].map(Duration::from_secs).to_vec()
        );
        assert_eq!(observed.len(), 4);
        assert_eq!(observed[0], (1, "boom 1".to_string(), Duration::from_secs(1)));
        assert_eq!(observed[3].0, 4);
    }

    #[test]
    fn zero_retries_invokes_exactly_once() {
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let result: Result<()> = retry(&policy(0), &sleeper, |_| {
            calls.set(calls.get() + 1);
            Err(anyhow!("nope"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
        assert!(sleeper.slept().is_empty());
    }

    #[test]
    fn success_after_failures_returns_value() {
        let sleeper = RecordingSleeper::default();
        let value = retry(&policy(3), &sleeper, |attempt| {
            if attempt < 3 {
                Err(anyhow!("flaky"))
            } else {
                Ok(attempt)
            }
        })
        .expect("eventually succeeds");
        assert_eq!(value, 3);
        assert_eq!(sleeper.slept().len(), 2);
    }

    /// Non-retryable kinds propagate on the first attempt without sleeping.
    #[test]
    fn non_retryable_kind_propagates_immediately() {
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let restricted = RetryPolicy {
            retryable: Retryable::transient(),
            ..policy(5)
        };
        let err = retry_with_backoff(
            &restricted,
            &sleeper,
            |_| -> Result<()> {
                calls.set(calls.get() + 1);
                Err(ClassifiedError::new(FailureKind::Auth, "token revoked"))
                    .context("send message")
            },
            |_, _, _| panic!("observer must not fire"),
        )
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(sleeper.slept().is_empty());
        assert_eq!(classify(&err), Some(FailureKind::Auth));
    }

    #[test]
    fn transient_kinds_are_retried_under_restricted_policy() {
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let restricted = RetryPolicy {
            retryable: Retryable::transient(),
            ..policy(2)
        };
        let _ = retry(&restricted, &sleeper, |_| -> Result<()> {
            calls.set(calls.get() + 1);
            Err(std::io::Error::from(ErrorKind::ConnectionReset)).context("fetch")
        });
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn unclassified_errors_are_not_retried_under_restricted_policy() {
        let restricted = RetryPolicy {
            retryable: Retryable::transient(),
            ..policy(2)
        };
        let sleeper = RecordingSleeper::default();
        let calls = Cell::new(0);
        let _ = retry(&restricted, &sleeper, |_| -> Result<()> {
            calls.set(calls.get() + 1);
            Err(anyhow!("mystery"))
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn io_kinds_map_to_failure_kinds() {
        let timed_out = anyhow::Error::from(std::io::Error::from(ErrorKind::TimedOut));
        assert_eq!(classify(&timed_out), Some(FailureKind::Timeout));
        let missing = anyhow::Error::from(std::io::Error::from(ErrorKind::NotFound));
        assert_eq!(classify(&missing), None);
    }
}
