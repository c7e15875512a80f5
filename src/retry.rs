//! Bounded retry with exponential backoff.
//
// Backing storage often lags behind the documents that reference it: a
// Resource can arrive before the file it names is visible. Handler
// construction and invocation therefore go through `attempt_with_retries`,
// which retries transient `HandlerError`s and gives up once the attempt or
// elapsed-time budget is spent.

use crate::handler::HandlerError;
use std::time::{Duration, Instant};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
    /// Give up once this much time has passed, even with attempts left.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(1024),
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delays slept between consecutive attempts.
    ///
    /// Never shorter than zero nor longer than `max_backoff`, whatever the
    /// multiplier; a NaN delay falls back to the cap.
    pub fn intervals(&self) -> impl Iterator<Item = Duration> + '_ {
        let cap = self.max_backoff.as_secs_f64();
        (0..self.max_attempts.saturating_sub(1)).map(move |n| {
            let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(n as i32);
            let secs = if secs.is_nan() { cap } else { secs.clamp(0.0, cap) };
            Duration::from_secs_f64(secs)
        })
    }
}

/// The last failure after the retry budget was spent.
#[derive(Debug)]
pub struct RetryExhausted {
    /// Attempts made, including the first
    pub attempts: u32,
    /// Error from the final attempt
    pub source: HandlerError,
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
///
/// Only transient errors are retried; anything else is returned after the
/// attempt that produced it.
pub fn attempt_with_retries<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, HandlerError>,
) -> Result<T, RetryExhausted> {
    let started = Instant::now();
    let mut delays = policy.intervals();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let error = match op() {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !error.is_transient() {
            return Err(RetryExhausted {
                attempts,
                source: error,
            });
        }
        let Some(delay) = delays.next() else {
            tracing::warn!(what, attempts, error = %error, "Retry budget exhausted");
            return Err(RetryExhausted {
                attempts,
                source: error,
            });
        };
        if let Some(budget) = policy.max_elapsed {
            if started.elapsed() + delay > budget {
                tracing::warn!(what, attempts, error = %error, "Retry time budget exhausted");
                return Err(RetryExhausted {
                    attempts,
                    source: error,
                });
            }
        }
        tracing::debug!(what, attempts, ?delay, error = %error, "Transient failure, retrying");
        std::thread::sleep(delay);
    }
}
