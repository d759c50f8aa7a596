//! Bounded retry with backoff.
//!
//! Every "try again until the device answers" loop in the crate goes through
//! [`RetryPolicy::run`], so no loop can block forever and every loop honors
//! the interrupt checker between attempts.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};

/// How often, and how patiently, to retry an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least one attempt is always made).
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for the delay between attempts.
    pub max_delay: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Retry with a constant delay between attempts.
    pub const fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1,
        }
    }

    /// Retry with a doubling delay, capped at `max_delay`.
    pub const fn exponential(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier: 2,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.multiplier).min(self.max_delay);
        }
        delay.min(self.max_delay.max(self.initial_delay))
    }

    /// Run `op` until it yields `Some`, an error, or the attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Errors end the loop
    /// immediately; `Ok(None)` means "not yet". Returns `Ok(None)` once every
    /// attempt came back empty, leaving the terminal error to the caller,
    /// which knows the context. Returns [`Error::Interrupted`] if cancellation
    /// is requested between attempts.
    pub fn run<T, F>(&self, mut op: F) -> Result<Option<T>>
    where
        F: FnMut(usize) -> Result<Option<T>>,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(value) = op(attempt)? {
                return Ok(Some(value));
            }
            if attempt < attempts {
                let delay = self.delay_after(attempt);
                debug!("Attempt {attempt}/{attempts} came back empty, retrying in {delay:?}");
                if crate::is_interrupted_requested() {
                    return Err(Error::Interrupted);
                }
                thread::sleep(delay);
            }
        }
        Ok(None)
    }
}
