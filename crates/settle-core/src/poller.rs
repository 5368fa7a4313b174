//! Bounded retry executor for conditions that become true eventually.
//!
//! A [`Poller`] invokes an action immediately and, while it keeps failing,
//! re-invokes it after a fixed interval until it succeeds or the timeout
//! elapses. On exhaustion the error from the *last* attempt is returned so
//! callers see the root cause instead of a bare "timed out".
//!
//! Polling happens entirely inside [`Poller::execute`]: nothing is spawned, and
//! an attempt that is still pending when its budget runs out is dropped.
//!
//! # Example
//!
//! ```no_run
//! use settle_core::poller::Poller;
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let poller = Poller::new(Duration::from_millis(250));
//! let result = poller
//!     .execute(|| async { Err::<(), _>("not ready") }, Duration::from_secs(1))
//!     .await;
//! assert!(result.unwrap_err().to_string().contains("not ready"));
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Interval used when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

/// Smallest interval a poller will use; keeps a zero interval from spinning.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Timeout plus fixed polling interval for one condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time budget for the condition.
    pub timeout: Duration,
    /// Fixed wait between a failed attempt and the next one.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Creates a policy with an explicit interval.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Creates a policy using [`DEFAULT_INTERVAL`].
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(timeout, DEFAULT_INTERVAL)
    }
}

/// Failure of a polled condition.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// Every attempt failed; `last` is the error of the final attempt.
    #[error("condition not met within {timeout:?} after {attempts} attempts: {last}")]
    Exhausted {
        last: E,
        attempts: u32,
        timeout: Duration,
    },

    /// No attempt finished at all: the only attempt outlived the time budget.
    #[error("condition not met within {timeout:?}: attempt {attempts} was still pending")]
    AttemptTimedOut { attempts: u32, timeout: Duration },
}

impl<E> PollError<E> {
    /// Returns the error of the last completed attempt, if any attempt completed.
    pub fn last(&self) -> Option<&E> {
        match self {
            PollError::Exhausted { last, .. } => Some(last),
            PollError::AttemptTimedOut { .. } => None,
        }
    }

    /// Consumes the error, returning the last attempt's error if there is one.
    pub fn into_last(self) -> Option<E> {
        match self {
            PollError::Exhausted { last, .. } => Some(last),
            PollError::AttemptTimedOut { .. } => None,
        }
    }

    /// The timeout that was exceeded.
    pub fn timeout(&self) -> Duration {
        match self {
            PollError::Exhausted { timeout, .. } | PollError::AttemptTimedOut { timeout, .. } => {
                *timeout
            }
        }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            PollError::Exhausted { attempts, .. } | PollError::AttemptTimedOut { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Repeats an action at a fixed interval until it succeeds or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    interval: Duration,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl Poller {
    /// Creates a poller that waits `interval` between failed attempts.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Returns the polling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs `action` under an explicit [`RetryPolicy`].
    pub async fn execute_policy<T, E, F, Fut>(
        policy: RetryPolicy,
        action: F,
    ) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        Self::new(policy.interval).execute(action, policy.timeout).await
    }

    /// Invokes `action` until it returns `Ok` or `timeout` has elapsed.
    ///
    /// The first attempt runs immediately. After a failure the poller sleeps for
    /// the interval (shortened so it never sleeps past the deadline) and tries
    /// again. Each attempt may run at most until one interval past the deadline,
    /// so the call returns no later than `timeout + interval`.
    ///
    /// `action` is invoked repeatedly and must not accumulate side effects.
    pub async fn execute<T, E, F, Fut>(
        &self,
        mut action: F,
        timeout: Duration,
    ) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts: u32 = 0;
        let mut last: Option<E> = None;

        loop {
            attempts += 1;
            let budget = deadline.saturating_duration_since(Instant::now()) + self.interval;

            match tokio::time::timeout(budget, action()).await {
                Ok(Ok(value)) => {
                    debug!(attempts, elapsed = ?start.elapsed(), "condition met");
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    debug!(attempt = attempts, error = %err, "condition not met yet");
                    last = Some(err);
                }
                Err(_) => {
                    debug!(attempt = attempts, ?budget, "attempt abandoned after its budget");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(match last {
                    Some(last) => PollError::Exhausted {
                        last,
                        attempts,
                        timeout,
                    },
                    None => PollError::AttemptTimedOut { attempts, timeout },
                });
            }

            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}
