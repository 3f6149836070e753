//! Failure classification and requeue backoff for certificate requests
//!
//! A failed sign or fetch is either retried after a jittered delay or turned
//! into a permanent failure. Which one depends on the [`RetryPolicy`]; errors
//! that clear on their own (the CA still issuing, throttling) are always
//! retried.

use std::time::Duration;

use rand::Rng;

use crate::Error;

/// Base delay before a failed request is retried
pub const REQUEUE_BASE: Duration = Duration::from_secs(60);

/// Upper bound (exclusive) of the random jitter added to [`REQUEUE_BASE`]
pub const REQUEUE_JITTER_SECS: u64 = 60;

/// Default bound on how long a request keeps being retried
pub const DEFAULT_MAX_RETRY_DURATION: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// What to do with a failed request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Record a temporary failure and requeue
    Retry,
    /// Mark the request Failed; it will not be looked at again
    Permanent,
}

/// How sign and fetch errors are classified
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Every non-transient sign or fetch error is permanent; other errors
    /// are retried
    Simple,
    /// Retryable errors are retried until the request is older than
    /// `max_retry_duration`
    Bounded {
        /// Maximum request age for which failures are retried
        max_retry_duration: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Bounded {
            max_retry_duration: DEFAULT_MAX_RETRY_DURATION,
        }
    }
}

impl RetryPolicy {
    /// Decide the fate of a request that failed with `error` at `age`
    pub fn classify(&self, error: &Error, age: Duration) -> Disposition {
        if error.is_transient() {
            return Disposition::Retry;
        }
        match self {
            Self::Simple if matches!(error, Error::Issuance { .. }) => Disposition::Permanent,
            Self::Simple => Disposition::Retry,
            Self::Bounded { max_retry_duration } => {
                if error.is_retryable() && age <= *max_retry_duration {
                    Disposition::Retry
                } else {
                    Disposition::Permanent
                }
            }
        }
    }
}

/// Source of requeue delays after a retryable failure
pub trait Requeuer: Send + Sync {
    /// Delay before the next attempt
    fn requeue_after(&self) -> Duration;
}

/// [`REQUEUE_BASE`] plus uniform jitter in `[0, REQUEUE_JITTER_SECS)` seconds
///
/// Spreads retries of many requests failing together across a minute.
#[derive(Clone, Copy, Debug, Default)]
pub struct JitteredRequeue;

impl Requeuer for JitteredRequeue {
    fn requeue_after(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..REQUEUE_JITTER_SECS);
        REQUEUE_BASE + Duration::from_secs(jitter)
    }
}

/// Constant delay, for tests and deterministic setups
#[derive(Clone, Copy, Debug)]
pub struct FixedRequeue(pub Duration);

impl Requeuer for FixedRequeue {
    fn requeue_after(&self) -> Duration {
        self.0
    }
}
