//! Retry decisions for failed attempts.
//!
//! Only transient failures are retried. Backoff doubles per attempt from
//! `base_delay`, is capped at `max_delay`, and carries ±20% jitter so
//! workers that failed together do not resubmit together.

use std::time::Duration;

use rand::Rng;

use crate::config::DeliveryConfig;

use super::{AttemptStatus, DeliveryAttempt};

/// Default jitter fraction applied to every backoff delay.
pub const DEFAULT_JITTER: f64 = 0.2;

/// What to do after an attempt resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the given delay.
    RetryAfter(Duration),
    /// Stop; the message is terminally failed.
    FailPermanently,
    /// Stop; the message was delivered.
    Succeed,
}

/// Bounded exponential-backoff retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    /// Create a policy with the default ±20% jitter.
    ///
    /// `max_attempts` counts the first attempt and is at least 1.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: DEFAULT_JITTER,
        }
    }

    /// Build a policy from the delivery configuration.
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            secs_to_duration(config.base_backoff_seconds),
            secs_to_duration(config.max_backoff_seconds),
        )
    }

    /// Override the jitter fraction (clamped to `0.0..=1.0`).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Maximum attempts per message, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what follows `attempt`.
    ///
    /// A provider-requested `retry_after` raises the delay but never lowers it.
    pub fn decide(&self, attempt: &DeliveryAttempt) -> RetryDecision {
        match attempt.status {
            AttemptStatus::Success => RetryDecision::Succeed,
            AttemptStatus::PermanentFailure => RetryDecision::FailPermanently,
            // An unresolved attempt is ambiguous; treat it as transient.
            AttemptStatus::TransientFailure | AttemptStatus::Pending => {
                if attempt.number >= self.max_attempts {
                    return RetryDecision::FailPermanently;
                }
                let delay = self.backoff(attempt.number);
                let delay = attempt
                    .retry_after
                    .map_or(delay, |requested| delay.max(requested));
                RetryDecision::RetryAfter(delay)
            }
        }
    }

    /// Capped backoff before the retry that follows attempt `attempt_number`, without jitter.
    pub fn nominal_backoff(&self, attempt_number: u32) -> Duration {
        let exponent = i32::try_from(attempt_number.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * 2_f64.powi(exponent);
        secs_to_duration(secs).min(self.max_delay)
    }

    /// Jittered backoff before the retry that follows attempt `attempt_number`.
    pub fn backoff(&self, attempt_number: u32) -> Duration {
        let nominal = self.nominal_backoff(attempt_number);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        secs_to_duration(nominal.as_secs_f64() * factor).min(self.max_delay)
    }
}

/// Convert float seconds to a [`Duration`], mapping negatives and NaN to zero
/// and overflow to [`Duration::MAX`].
fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
