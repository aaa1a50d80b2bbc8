//! Polynomial backoff with jitter.
//!
//! The delay before the next attempt is `n^exponent` seconds plus a jitter
//! drawn uniformly from `[jitter_min, jitter_max)`. With the defaults the
//! first retry waits 31 to 601 seconds and by the fifth the polynomial term
//! alone is 3125 seconds.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{DeliveryError, Result},
    DEFAULT_MAX_ATTEMPTS,
};

/// Retry policy for webhook delivery.
///
/// A plain value: the engine owns one and consults it after every retryable
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the initial one.
    pub max_attempts: u32,

    /// Degree of the polynomial backoff term.
    pub exponent: u32,

    /// Inclusive lower bound of the jitter.
    pub jitter_min: Duration,

    /// Exclusive upper bound of the jitter.
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            exponent: 5,
            jitter_min: Duration::from_secs(30),
            jitter_max: Duration::from_secs(600),
        }
    }
}

/// Result of consulting the policy after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the job again after `delay`.
    Retry {
        /// Wait before the next attempt
        delay: Duration,
    },
    /// Stop delivering; the ceiling has been reached.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

impl RetryPolicy {
    /// Returns the same policy with a different attempt ceiling.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Checks the policy for values that would make it meaningless.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if `max_attempts` is zero or
    /// the jitter range is inverted.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if self.jitter_min > self.jitter_max {
            return Err(DeliveryError::configuration(format!(
                "jitter_min ({:?}) exceeds jitter_max ({:?})",
                self.jitter_min, self.jitter_max
            )));
        }
        Ok(())
    }

    /// Computes the delay before the next attempt with a fresh jitter draw.
    pub fn next_delay(&self, attempt_number: u32) -> Duration {
        self.next_delay_with(attempt_number, &mut rand::rng())
    }

    /// Computes the delay using the supplied random source.
    ///
    /// The polynomial term saturates instead of overflowing.
    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt_number: u32, rng: &mut R) -> Duration {
        let polynomial = u64::from(attempt_number).saturating_pow(self.exponent);
        Duration::from_secs(polynomial).saturating_add(self.jitter(rng))
    }

    /// Decides whether to retry after `attempts_completed` attempts.
    pub fn decide(&self, attempts_completed: u32) -> RetryDecision {
        self.decide_with(attempts_completed, &mut rand::rng())
    }

    /// Same as [`RetryPolicy::decide`] with the supplied random source.
    pub fn decide_with<R: Rng + ?Sized>(
        &self,
        attempts_completed: u32,
        rng: &mut R,
    ) -> RetryDecision {
        if attempts_completed >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        RetryDecision::Retry { delay: self.next_delay_with(attempts_completed, rng) }
    }

    fn jitter<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min_ms = u64::try_from(self.jitter_min.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.jitter_max.as_millis()).unwrap_or(u64::MAX);

        if max_ms <= min_ms {
            return self.jitter_min;
        }

        Duration::from_millis(rng.random_range(min_ms..max_ms))
    }
}
