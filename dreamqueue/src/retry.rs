//! What happens to a job after a recoverable failure.
//!
//! By default a failed job goes straight back to the end of the queue, as many times as it
//! takes. A [`RetryPolicy`] can cap the number of attempts, after which the job is dropped with
//! an error log, and can delay the requeue with a [`Strategy`].
use std::{fmt, sync::Arc, time::Duration};

use crate::backoff::Strategy;

#[derive(Clone, Default)]
pub struct RetryPolicy {
    max_attempts: Option<u16>,
    backoff: Option<Arc<dyn Strategy + Send + Sync>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retry {
    Now,
    After(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Retry forever without delay.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Drop a job once it has been attempted `max_attempts` times.
    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            ..self
        }
    }

    pub fn with_backoff(self, strategy: impl Strategy + Send + Sync + 'static) -> Self {
        Self {
            backoff: Some(Arc::new(strategy)),
            ..self
        }
    }

    pub fn max_attempts(&self) -> Option<u16> {
        self.max_attempts
    }

    pub(crate) fn decide(&self, attempt: u16) -> Retry {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return Retry::GiveUp;
        }
        match self
            .backoff
            .as_ref()
            .and_then(|strategy| strategy.backoff(attempt).to_std().ok())
        {
            Some(delay) if !delay.is_zero() => Retry::After(delay),
            _ => Retry::Now,
        }
    }
}
