//! Bounded retry with exponential backoff and jitter for remote calls.
//!
//! [`retry_async`] wraps one fallible async operation (attach, connection test, partition
//! extraction). Each attempt runs under its own timeout; an attempt that times out counts as a
//! transient failure. Only errors whose [`Retryable::is_transient`] is true are retried, and when
//! attempts run out the last error is returned as-is so its classification survives.

use std::fmt::{self, Display};
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors that can be classified for retry purposes.
pub trait Retryable: Sized {
    /// Whether the failure is expected to clear up on a later attempt.
    fn is_transient(&self) -> bool;

    /// The error an attempt that exceeded its timeout is recorded as.
    fn timed_out(label: &str, after: Duration) -> Self;
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryOutcome<E> {
    /// The cancellation token fired before the operation succeeded.
    Cancelled,
    /// Every attempt failed transiently.
    Exhausted { attempts: u32, last_error: E },
    /// A permanent failure ended the loop early.
    Failed { attempts: u32, error: E },
}

impl<E: Display> Display for RetryOutcome<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Exhausted { attempts, last_error } => {
                write!(f, "gave up after {attempts} attempts: {last_error}")
            }
            Self::Failed { error, .. } => write!(f, "{error}"),
        }
    }
}

impl<E: Display + fmt::Debug> std::error::Error for RetryOutcome<E> {}

impl<E> RetryOutcome<E> {
    /// Number of attempts made before giving up (zero when cancelled before the first).
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled => 0,
            Self::Exhausted { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    /// The last underlying error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Failed { error, .. } => Some(error),
        }
    }
}

/// Exponential backoff schedule with an attempt ceiling.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: f64,
    /// Total attempts including the first.
    pub max_attempts: u32,
    current_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 0.2, 3)
    }
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
            current_backoff: initial,
        }
    }

    /// A policy with no waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 0.0, max_attempts)
    }

    /// The delay before the next attempt; doubles up to `max` on every call.
    pub fn next_backoff(&mut self) -> Duration {
        let current = self.current_backoff;
        self.current_backoff = current.saturating_mul(2).min(self.max);

        if self.jitter > 0.0 && !current.is_zero() {
            let factor = 1.0 + rand::rng().random_range(-self.jitter..self.jitter);
            current.mul_f64(factor).max(Duration::from_nanos(1))
        } else {
            current
        }
    }

    pub fn reset(&mut self) {
        self.current_backoff = self.initial;
    }

    fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts, or is cancelled.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Fut, Op>(
    mut op: Op,
    attempt_timeout: Duration,
    mut policy: RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
) -> Result<T, RetryOutcome<E>>
where
    E: Retryable + Display,
    Fut: Future<Output = Result<T, E>>,
    Op: FnMut(u32) -> Fut,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryOutcome::Cancelled);
        }
        attempt += 1;
        debug!(label, attempt, "starting attempt");

        let error = match timeout(attempt_timeout, op(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(label, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(_elapsed) => E::timed_out(label, attempt_timeout),
        };

        if !error.is_transient() {
            warn!(label, attempt, error = %error, "permanent failure, not retrying");
            return Err(RetryOutcome::Failed {
                attempts: attempt,
                error,
            });
        }
        if !policy.has_attempts_left(attempt) {
            warn!(label, attempt, error = %error, "retries exhausted");
            return Err(RetryOutcome::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let backoff = policy.next_backoff();
        warn!(
            label,
            attempt,
            error = %error,
            backoff_ms = backoff.as_millis() as u64,
            "transient failure, backing off"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryOutcome::Cancelled),
            _ = sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Refused,
        BadPassword,
        TimedOut,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Refused | TestError::TimedOut)
        }
        fn timed_out(_label: &str, _after: Duration) -> Self {
            TestError::TimedOut
        }
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(350), 0.0, 5);
        assert_eq!(policy.next_backoff(), Duration::from_millis(100));
        assert_eq!(policy.next_backoff(), Duration::from_millis(200));
        assert_eq!(policy.next_backoff(), Duration::from_millis(350));
        assert_eq!(policy.next_backoff(), Duration::from_millis(350));
        policy.reset();
        assert_eq!(policy.next_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut policy = RetryPolicy::new(Duration::from_millis(1000), Duration::from_millis(1000), 0.2, 5);
        for _ in 0..50 {
            let b = policy.next_backoff();
            assert!(b >= Duration::from_millis(800) && b <= Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let out = retry_async(
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TestError::Refused)
                    } else {
                        Ok(attempt)
                    }
                }
            },
            Duration::from_secs(5),
            RetryPolicy::immediate(3),
            &cancel,
            "test",
        )
        .await;
        assert_eq!(out.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let out: Result<(), _> = retry_async(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::BadPassword) }
            },
            Duration::from_secs(5),
            RetryPolicy::immediate(3),
            &cancel,
            "test",
        )
        .await;
        let outcome = out.unwrap_err();
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.into_inner(), Some(TestError::BadPassword));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error() {
        let cancel = CancellationToken::new();
        let out: Result<(), _> = retry_async(
            |_| async { Err(TestError::Refused) },
            Duration::from_secs(5),
            RetryPolicy::immediate(3),
            &cancel,
            "test",
        )
        .await;
        match out.unwrap_err() {
            RetryOutcome::Exhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, TestError::Refused);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_attempts_time_out_and_count_as_transient() {
        let cancel = CancellationToken::new();
        let out: Result<(), _> = retry_async(
            |_| async {
                sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            Duration::from_millis(10),
            RetryPolicy::immediate(2),
            &cancel,
            "slow",
        )
        .await;
        let outcome = out.unwrap_err();
        assert_eq!(outcome.attempts(), 2);
        assert_eq!(outcome.into_inner(), Some(TestError::TimedOut));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out: Result<(), RetryOutcome<TestError>> = retry_async(
            |_| async { Ok(()) },
            Duration::from_secs(1),
            RetryPolicy::immediate(3),
            &cancel,
            "cancelled",
        )
        .await;
        assert!(matches!(out, Err(RetryOutcome::Cancelled)));
    }
}
