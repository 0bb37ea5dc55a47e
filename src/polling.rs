//! Bounded poll loops for asynchronous external jobs.
//!
//! Every wait in the pipeline (discovery jobs, query executions, schema
//! availability, scan retries) runs through [`poll_until`] or
//! [`retry_transient`]. Both stop after `max_attempts` checks, so a stuck
//! external job always ends in a timeout error instead of a hang.

use std::future::Future;
use std::task::Poll;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::emit;
use crate::metrics::events::{PollAttempt, PollKind, PollWaitDuration};

/// Attempt budget and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn max_wait(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

/// Why a poll loop stopped without a result.
#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    /// Every attempt came back pending.
    Exhausted { attempts: u32 },
    /// A check failed outright.
    Check(E),
}

/// Run `check` until it returns `Poll::Ready`, sleeping `policy.delay`
/// between pending results.
///
/// The closure receives the 1-based attempt number. Errors from `check` end
/// the loop immediately. No sleep follows the final attempt.
pub async fn poll_until<T, E, F, Fut>(
    policy: RetryPolicy,
    kind: PollKind,
    target: &str,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Poll<T>, E>>,
{
    let started = Instant::now();

    for attempt in 1..=policy.max_attempts {
        emit!(PollAttempt { kind });
        match check(attempt).await.map_err(PollError::Check)? {
            Poll::Ready(value) => {
                emit!(PollWaitDuration {
                    kind,
                    duration: started.elapsed(),
                });
                return Ok(value);
            }
            Poll::Pending => {
                debug!(
                    subject = target,
                    "{} not ready (attempt {}/{})",
                    kind.as_str(),
                    attempt,
                    policy.max_attempts
                );
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(PollError::Exhausted {
        attempts: policy.max_attempts,
    })
}

/// Run `op` until it succeeds, retrying errors for which `is_transient`
/// returns true. The last error is returned once the budget is spent.
pub async fn retry_transient<T, E, F, Fut, R>(
    policy: RetryPolicy,
    target: &str,
    mut op: F,
    is_transient: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < policy.max_attempts => {
                debug!(
                    subject = target,
                    "attempt {}/{} failed, retrying in {:?}: {}",
                    attempt,
                    policy.max_attempts,
                    policy.delay,
                    err
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_attempt() {
        let started = tokio::time::Instant::now();
        let result: Result<u32, PollError<()>> =
            poll_until(policy(5), PollKind::Query, "t", |attempt| async move {
                Ok(if attempt == 3 {
                    Poll::Ready(attempt)
                } else {
                    Poll::Pending
                })
            })
            .await;

        assert_eq!(result, Ok(3));
        // Two sleeps between three attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_budget() {
        let calls = Cell::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), PollError<()>> =
            poll_until(policy(4), PollKind::Discovery, "t", |_| {
                calls.set(calls.get() + 1);
                async { Ok(Poll::Pending) }
            })
            .await;

        assert_eq!(result, Err(PollError::Exhausted { attempts: 4 }));
        assert_eq!(calls.get(), 4);
        assert_eq!(started.elapsed(), policy(4).max_wait());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_error_stops_loop() {
        let calls = Cell::new(0);
        let result: Result<(), PollError<&str>> =
            poll_until(policy(4), PollKind::Schema, "t", |_| {
                calls.set(calls.get() + 1);
                async { Err("boom") }
            })
            .await;

        assert_eq!(result, Err(PollError::Check("boom")));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_recovers() {
        let result: Result<u32, String> = retry_transient(
            policy(3),
            "t",
            |attempt| async move {
                if attempt < 3 {
                    Err(format!("throttled {attempt}"))
                } else {
                    Ok(attempt)
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_gives_up_on_permanent_error() {
        let calls = Cell::new(0);
        let result: Result<(), String> = retry_transient(
            policy(5),
            "t",
            |_| {
                calls.set(calls.get() + 1);
                async { Err("expired".to_string()) }
            },
            |err| err != "expired",
        )
        .await;
        assert_eq!(result, Err("expired".to_string()));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_returns_last_error() {
        let result: Result<(), String> = retry_transient(
            policy(2),
            "t",
            |attempt| async move { Err(format!("attempt {attempt}")) },
            |_| true,
        )
        .await;
        assert_eq!(result, Err("attempt 2".to_string()));
    }
}
