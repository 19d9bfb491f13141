//! Delays applied before a failed job goes back onto the queue.
//!
//! Two strategies are provided, constant and exponential, each optionally modified by a random
//! [`Jitter`]. All constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use dreamqueue::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::minutes(1))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(1)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::seconds(1));
//! assert!(strategy.backoff(1) <= TimeDelta::seconds(3));
//! assert!(strategy.backoff(10) <= TimeDelta::seconds(61));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of attempts made so far (starting at 1), returns how long to wait
    /// before the job is queued again.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Always waits the same amount of time.
///
/// Constructed via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Doubles the delay with each attempt: `base`, `2 * base`, `4 * base`, ...
///
/// Constructed via [`BackoffStrategy::exponential`]. Setting a maximum with
/// [`BackoffStrategy::with_max`] is advisable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let exponent = u32::from(attempt.saturating_sub(1)).min(30);
        let factor = 1_i32 << exponent;
        let backoff = self.base.checked_mul(factor).unwrap_or(TimeDelta::MAX);
        match self.max {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Adds a random value in the range `-delta..=delta`.
    Absolute(TimeDelta),
    /// Adds a random value proportional to the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .abs();
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A backoff [`Strategy`] with optional jitter and lower bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the value returned by [`Strategy::backoff`], before jitter, to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Never return less than `min`, even after jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_backoff() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::constant(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay);
        }
    }

    #[test]
    fn constant_backoff_with_relative_jitter() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Relative(0.1));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - TimeDelta::seconds(6));
            assert!(backoff <= delay + TimeDelta::seconds(6));
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2));

        assert_eq!(strategy.backoff(0), TimeDelta::seconds(2));
        assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
        assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
    }

    #[test]
    fn exponential_backoff_with_max() {
        let max = TimeDelta::minutes(10);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1)).with_max(max);

        assert_eq!(strategy.backoff(u16::MAX), max);
        for i in 1..100 {
            assert!(strategy.backoff(i) <= max);
        }
    }

    #[test]
    fn jitter_never_goes_below_min() {
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::constant(TimeDelta::seconds(6))
            .with_jitter(Jitter::Absolute(TimeDelta::seconds(20)))
            .with_min(min);

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= min);
            assert!(backoff <= TimeDelta::seconds(26));
        }
    }
}
