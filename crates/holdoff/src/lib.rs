// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Backoff policies for pacing retry attempts.
//!
//! # Why
//!
//! Retrying a failed operation immediately tends to make a bad situation worse:
//! the dependency that just failed gets hammered by every caller at once. A
//! backoff policy spaces attempts out, giving the dependency room to recover
//! while keeping the caller's total wait bounded.
//!
//! # Core Types
//!
//! - [`Backoff`]: the policy contract. [`Backoff::delay`] produces the next wait
//!   interval and advances internal state; [`Backoff::reset`] returns the policy
//!   to its initial state.
//! - [`ExponentialBackoff`]: doubling delays offset to interval midpoints,
//!   clamped to a maximum.
//! - [`ConstantBackoff`]: the same delay on every call.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//!
//! use holdoff::{Backoff, ExponentialBackoff};
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(20))?;
//!
//! assert_eq!(backoff.delay(), Duration::from_millis(500));
//! assert_eq!(backoff.delay(), Duration::from_millis(1500));
//! assert_eq!(backoff.delay(), Duration::from_millis(3500));
//!
//! // A successful operation resets the sequence.
//! backoff.reset();
//! assert_eq!(backoff.delay(), Duration::from_millis(500));
//! # Ok::<(), holdoff::BackoffError>(())
//! ```

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Produces wait intervals between retry attempts.
///
/// Implementations are stateful: each call to [`Backoff::delay`] returns the
/// next interval in the policy's sequence and advances the internal position.
/// Callers reset the policy when the guarded operation succeeds so that the
/// next failure starts the sequence from the beginning.
pub trait Backoff {
    /// Returns the next wait interval and advances the policy's state.
    fn delay(&mut self) -> Duration;

    /// Returns the policy to its initial state.
    ///
    /// The next call to [`Backoff::delay`] reproduces the sequence from the
    /// beginning, exactly as a freshly constructed policy would.
    fn reset(&mut self);
}

/// Exponentially growing delays, clamped to a maximum.
///
/// The Nth delay (N starting at zero) is
/// `min(max_delay, initial_delay * 2^N - initial_delay / 2)`. The half-interval
/// offset yields midpoint delays without randomness: for an initial delay of
/// one second the sequence is `0.5s, 1.5s, 3.5s, 7.5s, 15.5s, …`, clamped at
/// the configured maximum thereafter.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use holdoff::{Backoff, ExponentialBackoff};
///
/// let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(4))?;
///
/// assert_eq!(backoff.delay(), Duration::from_millis(500));
/// assert_eq!(backoff.delay(), Duration::from_millis(1500));
/// assert_eq!(backoff.delay(), Duration::from_millis(3500));
/// assert_eq!(backoff.delay(), Duration::from_secs(4));
/// assert_eq!(backoff.delay(), Duration::from_secs(4));
/// # Ok::<(), holdoff::BackoffError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    calls: u32,
}

impl ExponentialBackoff {
    /// Creates a new exponential backoff policy.
    ///
    /// `initial_delay` controls the scale of the sequence and `max_delay` is
    /// the upper clamp applied to every produced delay.
    ///
    /// # Errors
    ///
    /// Returns [`BackoffError`] if either duration is zero, or if `max_delay`
    /// is smaller than the first delay of the sequence (`initial_delay / 2`),
    /// which would make every delay a degenerate clamp.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Result<Self, BackoffError> {
        if initial_delay.is_zero() {
            return Err(BackoffError::invalid_argument("initial_delay must be set and positive"));
        }

        if max_delay.is_zero() {
            return Err(BackoffError::invalid_argument("max_delay must be set and positive"));
        }

        if max_delay < initial_delay / 2 {
            return Err(BackoffError::invalid_argument("max_delay must not be smaller than the first delay"));
        }

        Ok(Self {
            initial_delay,
            max_delay,
            calls: 0,
        })
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&mut self) -> Duration {
        let n = self.calls;
        self.calls = self.calls.saturating_add(1);

        // 2^N overflows well before Duration does; either overflow means the
        // raw delay is far past the clamp.
        let raw = 1u32
            .checked_shl(n)
            .and_then(|factor| self.initial_delay.checked_mul(factor));

        match raw {
            Some(delay) => delay.saturating_sub(self.initial_delay / 2).min(self.max_delay),
            None => self.max_delay,
        }
    }

    fn reset(&mut self) {
        self.calls = 0;
    }
}

/// The same delay on every call.
///
/// Useful where a caller wants pacing without growth, such as polling loops
/// with a fixed cadence. [`Backoff::reset`] has no effect.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use holdoff::{Backoff, ConstantBackoff};
///
/// let mut backoff = ConstantBackoff::new(Duration::from_millis(100));
///
/// assert_eq!(backoff.delay(), Duration::from_millis(100));
/// assert_eq!(backoff.delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    delay: Duration,
}

impl ConstantBackoff {
    /// Creates a new constant backoff policy producing `delay` on every call.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for ConstantBackoff {
    fn delay(&mut self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}
}

/// An error produced when constructing a backoff policy with invalid
/// parameters.
///
/// # Limited introspection
///
/// Other than implementing the [`std::error::Error`] and [`core::fmt::Debug`]
/// traits, this error type currently provides no introspection capabilities.
#[derive(Debug)]
pub struct BackoffError(Cow<'static, str>);

impl BackoffError {
    fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self(message.into())
    }
}

impl Display for BackoffError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "invalid backoff argument: {}", self.0)
    }
}

impl std::error::Error for BackoffError {}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ExponentialBackoff: Debug, Clone, Send, Sync);
    assert_impl_all!(ConstantBackoff: Debug, Clone, Send, Sync);
    assert_impl_all!(BackoffError: Debug, Send, Sync);

    const fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    const fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn exponential_sequence_exact() {
        let mut backoff = ExponentialBackoff::new(secs(1), secs(20)).unwrap();

        let produced: Vec<_> = (0..8).map(|_| backoff.delay()).collect();
        assert_eq!(
            produced,
            vec![
                millis(500),
                millis(1500),
                millis(3500),
                millis(7500),
                millis(15_500),
                secs(20),
                secs(20),
                secs(20),
            ]
        );
    }

    #[test]
    fn exponential_reset_restarts_sequence() {
        let mut backoff = ExponentialBackoff::new(secs(1), secs(20)).unwrap();

        let first: Vec<_> = (0..5).map(|_| backoff.delay()).collect();
        backoff.reset();
        let second: Vec<_> = (0..5).map(|_| backoff.delay()).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn exponential_scales_with_initial_delay() {
        let mut backoff = ExponentialBackoff::new(millis(200), secs(60)).unwrap();

        assert_eq!(backoff.delay(), millis(100));
        assert_eq!(backoff.delay(), millis(300));
        assert_eq!(backoff.delay(), millis(700));
        assert_eq!(backoff.delay(), millis(1500));
    }

    #[test]
    fn exponential_clamps_after_overflow() {
        let mut backoff = ExponentialBackoff::new(secs(86_400), secs(172_800)).unwrap();

        // Run far past the point where 2^N no longer fits; every delay must
        // stay at the clamp rather than wrap or panic.
        for _ in 0..100 {
            let _ = backoff.delay();
        }

        assert_eq!(backoff.delay(), secs(172_800));
    }

    #[test]
    fn exponential_rejects_zero_initial_delay() {
        let error = ExponentialBackoff::new(Duration::ZERO, secs(20)).unwrap_err();
        assert!(error.to_string().contains("initial_delay"));
    }

    #[test]
    fn exponential_rejects_zero_max_delay() {
        let error = ExponentialBackoff::new(secs(1), Duration::ZERO).unwrap_err();
        assert!(error.to_string().contains("max_delay"));
    }

    #[test]
    fn exponential_rejects_max_below_first_delay() {
        let error = ExponentialBackoff::new(secs(10), secs(2)).unwrap_err();
        assert!(error.to_string().contains("max_delay"));
    }

    #[test]
    fn exponential_max_equal_to_first_delay_is_constant() {
        let mut backoff = ExponentialBackoff::new(secs(1), millis(500)).unwrap();

        assert_eq!(backoff.delay(), millis(500));
        assert_eq!(backoff.delay(), millis(500));
        assert_eq!(backoff.delay(), millis(500));
    }

    #[test]
    fn constant_returns_same_delay() {
        let mut backoff = ConstantBackoff::new(millis(100));

        assert_eq!(backoff.delay(), millis(100));
        assert_eq!(backoff.delay(), millis(100));

        backoff.reset();
        assert_eq!(backoff.delay(), millis(100));
    }

    #[test]
    fn backoff_error_display() {
        let error = ExponentialBackoff::new(Duration::ZERO, secs(20)).unwrap_err();
        assert!(error.to_string().starts_with("invalid backoff argument"));
    }
}
