//! Bounded retry loop with linear backoff.
//!
//! Every remote call nodepool makes (lock server queries, IaaS CLI
//! invocations, status polls) runs inside a [`RetryLoop`]. The operation
//! reports each failure as either [`Attempt::Retry`] (transient, try again
//! after sleeping) or [`Attempt::Abort`] (stop now), and the loop resolves
//! to a tri-state [`RetryOutcome`] so call sites never inspect loop flags.
//!
//! The sleep before attempt `n + 1` is `sleep + (n - 1) * increment`.
//!
//! # Example
//!
//! ```ignore
//! use nodepool_core::retry::{retry, Attempt, RetryPolicy};
//!
//! let policy = RetryPolicy::new(Duration::from_secs(1))
//!     .increment(Duration::from_millis(500))
//!     .tries(10);
//! let status = retry(&policy, "get_status smithi001", || async {
//!     fetch().await.map_err(Attempt::Retry)
//! })
//! .await
//! .ok();
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Backoff parameters for a [`RetryLoop`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub sleep: Duration,
    /// Added to the delay after every further failed attempt.
    pub increment: Duration,
    /// Maximum number of attempts (`None` = retry forever).
    pub tries: Option<u32>,
    /// Wall-clock budget across all attempts.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            sleep: Duration::from_secs(6),
            increment: Duration::ZERO,
            tries: Some(10),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// A policy sleeping `sleep` between attempts, 10 tries, no increment.
    pub fn new(sleep: Duration) -> Self {
        Self {
            sleep,
            ..Default::default()
        }
    }

    /// Grow the delay by `increment` after each failure.
    pub fn increment(mut self, increment: Duration) -> Self {
        self.increment = increment;
        self
    }

    /// Give up after `tries` attempts (at least one attempt is always made).
    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries.max(1));
        self
    }

    /// Retry until success. Pair with [`RetryPolicy::timeout`] or a
    /// shutdown receiver if waiting forever is not acceptable.
    pub fn unbounded(mut self) -> Self {
        self.tries = None;
        self
    }

    /// Give up once the next sleep would cross `timeout` since the first attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay slept after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.sleep
            .saturating_add(self.increment.saturating_mul(failures.saturating_sub(1)))
    }
}

/// How a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<E> {
    /// Transient failure; sleep and try again if the budget allows.
    Retry(E),
    /// Non-retryable failure; stop immediately.
    Abort(E),
}

impl<E> Attempt<E> {
    /// The wrapped failure, whichever kind it is.
    pub fn into_inner(self) -> E {
        match self {
            Attempt::Retry(e) | Attempt::Abort(e) => e,
        }
    }
}

/// Result of running a [`RetryLoop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// An attempt succeeded.
    Success(T),
    /// The try budget, timeout, or shutdown signal ended the loop.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with [`Attempt::Abort`].
    Aborted(E),
}

impl<T, E> RetryOutcome<T, E> {
    /// The success value, discarding any failure.
    pub fn ok(self) -> Option<T> {
        match self {
            RetryOutcome::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Collapse to a `Result`, surfacing the last failure on exhaustion.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Success(value) => Ok(value),
            RetryOutcome::Exhausted { last, .. } => Err(last),
            RetryOutcome::Aborted(e) => Err(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success(_))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryOutcome::Exhausted { .. })
    }
}

/// A labelled retry loop driven by a [`RetryPolicy`].
///
/// Each `run` owns its own attempt counter and clock, so one policy can
/// be shared by any number of concurrent loops.
pub struct RetryLoop<'a> {
    policy: &'a RetryPolicy,
    action: String,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<'a> RetryLoop<'a> {
    /// Create a loop; `action` labels the log lines it emits.
    pub fn new(policy: &'a RetryPolicy, action: impl Into<String>) -> Self {
        Self {
            policy,
            action: action.into(),
            shutdown: None,
        }
    }

    /// Stop at the next loop boundary once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Drive `operation` until it succeeds, aborts, or the budget runs out.
    pub async fn run<F, Fut, T, E>(self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Attempt<E>>>,
        E: Display,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(action = %self.action, attempt, "succeeded after retrying");
                    }
                    return RetryOutcome::Success(value);
                }
                Err(Attempt::Abort(e)) => {
                    debug!(action = %self.action, attempt, error = %e, "non-retryable failure");
                    return RetryOutcome::Aborted(e);
                }
                Err(Attempt::Retry(e)) => e,
            };

            if self.policy.tries.is_some_and(|max| attempt >= max) {
                debug!(action = %self.action, attempt, error = %error, "giving up, tries exhausted");
                return RetryOutcome::Exhausted {
                    attempts: attempt,
                    last: error,
                };
            }

            let delay = self.policy.delay_after(attempt);

            if let Some(timeout) = self.policy.timeout {
                if started.elapsed() + delay > timeout {
                    debug!(action = %self.action, attempt, ?timeout, "giving up, timed out");
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        last: error,
                    };
                }
            }

            if self.shutdown_requested() {
                debug!(action = %self.action, attempt, "giving up, shutdown requested");
                return RetryOutcome::Exhausted {
                    attempts: attempt,
                    last: error,
                };
            }

            debug!(
                action = %self.action,
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );

            tokio::time::sleep(delay).await;
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Shorthand for `RetryLoop::new(policy, action).run(operation)`.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    action: &str,
    operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
    E: Display,
{
    RetryLoop::new(policy, action).run(operation).await
}
