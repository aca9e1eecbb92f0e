//! Bounded Retry
//!
//! One retry combinator parameterised by attempt budget, per-attempt timeout
//! and backoff. Session setup uses it for reachability probes and login
//! attempts; the transaction engine uses it for resend-on-timeout.
//!
//! Two shapes are offered:
//!
//! - [`retry`] for stateless operations expressed as an async closure
//! - [`Attempts`] for loops that keep mutable state across attempts
//!   (the transaction engine accumulates its receive buffer this way)

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Delay inserted between two attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately
    #[default]
    None,
    /// Constant delay between attempts
    Fixed(Duration),
    /// Delay doubles each attempt, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait before the attempt with the given zero-based index
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }
}

/// Attempt budget, per-attempt timeout and backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts (never less than one)
    pub attempts: u32,
    /// Time allowed for each individual attempt
    pub timeout: Duration,
    /// Delay policy between attempts
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            timeout: Duration::from_secs(30),
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy; a zero budget is raised to one attempt
    pub fn new(attempts: u32, timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            timeout,
            backoff: Backoff::None,
        }
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Iterate over the attempts of this policy
    pub fn attempts(&self) -> Attempts {
        Attempts {
            policy: *self,
            next: 0,
        }
    }
}

/// One attempt handed out by [`Attempts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Zero-based attempt index, equal to the retries consumed so far
    pub index: u32,
    /// Total budget
    pub budget: u32,
    /// Timeout for this attempt
    pub timeout: Duration,
}

impl Attempt {
    /// One-based attempt number, for logging
    pub fn number(&self) -> u32 {
        self.index + 1
    }

    /// Whether this is the final attempt of the budget
    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.budget
    }
}

/// Stateful attempt iterator; sleeps the backoff delay before handing out
/// every attempt after the first
#[derive(Debug)]
pub struct Attempts {
    policy: RetryPolicy,
    next: u32,
}

impl Attempts {
    /// Wait out the backoff and return the next attempt, or `None` once the
    /// budget is exhausted
    pub async fn next_attempt(&mut self) -> Option<Attempt> {
        if self.next >= self.policy.attempts.max(1) {
            return None;
        }
        let delay = self.policy.backoff.delay_before(self.next);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let attempt = Attempt {
            index: self.next,
            budget: self.policy.attempts.max(1),
            timeout: self.policy.timeout,
        };
        self.next += 1;
        Some(attempt)
    }

    /// Attempts handed out so far
    pub fn used(&self) -> u32 {
        self.next
    }
}

/// Final error of a retried operation together with the attempts spent
#[derive(Debug)]
pub struct Exhausted<E> {
    pub last_error: E,
    pub attempts: u32,
}

/// Run `op` until it succeeds or the budget is exhausted.
///
/// Each attempt is bounded by the policy timeout; an elapsed attempt counts
/// as a failure and is reported as `None` in [`Exhausted::last_error`].
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> std::result::Result<T, Exhausted<Option<E>>>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempts = policy.attempts();
    let mut last_error = None;

    while let Some(attempt) = attempts.next_attempt().await {
        match tokio::time::timeout(attempt.timeout, op(attempt)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                debug!("attempt {}/{} failed", attempt.number(), attempt.budget);
                last_error = Some(e);
            }
            Err(_) => {
                debug!(
                    "attempt {}/{} timed out after {:?}",
                    attempt.number(),
                    attempt.budget,
                    attempt.timeout
                );
                last_error = None;
            }
        }
    }

    Err(Exhausted {
        last_error,
        attempts: attempts.used(),
    })
}
