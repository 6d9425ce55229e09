//! Token-bucket rate limiter shared by every delivery worker in the process.
//!
//! Refill is computed lazily from elapsed time on each acquisition, so an
//! idle limiter costs nothing and cannot drift. Waiting callers sleep
//! (cooperative suspension) outside the lock; ordering between waiters is not
//! guaranteed.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// The limiter could not grant a slot within its maximum wait.
///
/// Distinct from provider errors: no call was attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limiter slot not granted after waiting {waited:?}")]
pub struct RateLimitTimeout {
    /// Time spent waiting before giving up.
    pub waited: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with capacity `burst` refilled at `rate_per_second`.
///
/// Uses a sync [`Mutex`] since the critical section is very short (no awaits).
/// A grant and its decrement happen under one lock acquisition.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    rate_per_second: f64,
    burst: f64,
    max_wait: Duration,
}

impl RateLimiter {
    /// Create a full bucket.
    ///
    /// `rate_per_second` and `burst` are clamped to sensible minimums so a
    /// misconfigured limiter still makes progress.
    pub fn new(rate_per_second: f64, burst: u32, max_wait: Duration) -> Self {
        let rate_per_second = if rate_per_second.is_finite() && rate_per_second > 0.0 {
            rate_per_second
        } else {
            f64::MIN_POSITIVE
        };
        let burst = f64::from(burst.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate_per_second,
            burst,
            max_wait,
        }
    }

    /// Build a limiter from the delivery configuration.
    pub fn from_config(config: &crate::config::DeliveryConfig) -> Self {
        Self::new(
            config.rate_per_second(),
            config.rate_burst,
            config.rate_limit_max_wait(),
        )
    }

    /// Wait until `cost` tokens are available, then take them.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitTimeout`] when the tokens cannot be granted within
    /// the configured maximum wait, or immediately when `cost` exceeds the
    /// bucket capacity.
    pub async fn acquire(&self, cost: u32) -> Result<(), RateLimitTimeout> {
        let started = Instant::now();
        let cost = f64::from(cost);
        if cost > self.burst {
            return Err(RateLimitTimeout {
                waited: Duration::ZERO,
            });
        }

        loop {
            let wait = match self.try_take(cost) {
                None => return Ok(()),
                Some(wait) => wait,
            };

            let waited = started.elapsed();
            if waited.saturating_add(wait) > self.max_wait {
                return Err(RateLimitTimeout { waited });
            }
            trace!(wait_ms = wait.as_millis(), "rate limiter waiting for tokens");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take `cost` tokens if immediately available.
    pub fn try_acquire(&self, cost: u32) -> bool {
        self.try_take(f64::from(cost)).is_none()
    }

    /// Tokens currently in the bucket (after refill).
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    /// Refill, then take `cost` tokens or report how long until they exist.
    fn try_take(&self, cost: f64) -> Option<Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return None;
        }
        let deficit = cost - bucket.tokens;
        let secs = (deficit / self.rate_per_second).max(0.001);
        Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate_per_second).min(self.burst);
        bucket.last_refill = now;
    }
}
