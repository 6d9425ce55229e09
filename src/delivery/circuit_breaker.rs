//! Failure-tripped circuit breakers, one per provider or per recipient domain.
//!
//! ```text
//!   Closed ──(threshold failures in window)──▶ Open
//!     ▲                                         │ cool-down elapsed
//!     │ trial succeeds                          ▼
//!     └──────────────────────────────────── HalfOpen ──(trial fails)──▶ Open
//! ```
//!
//! Every read-modify-write happens under one mutex, so two callers can never
//! observe or apply conflicting transitions. In `HalfOpen` exactly one caller
//! is admitted as the trial call; everyone else is rejected as if still open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::DeliveryConfig;

/// Breaker key used when breakers are shared across all recipients.
pub const PROVIDER_SCOPE_KEY: &str = "provider";

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the cool-down elapses.
    Open,
    /// A single trial call is allowed through.
    HalfOpen,
}

/// Granularity at which failures are isolated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitScope {
    /// One breaker for the whole provider.
    #[default]
    Provider,
    /// One breaker per recipient domain.
    Domain,
}

/// A breaker rejected the call without any network activity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for {key}; retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Breaker key (provider or domain).
    pub key: String,
    /// Time until the breaker is willing to admit a trial call.
    pub retry_after: Duration,
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures within `failure_window` that trip the breaker.
    pub failure_threshold: u32,
    /// Failures older than this restart the count.
    pub failure_window: Duration,
    /// Time spent open before probing.
    pub cool_down: Duration,
}

impl BreakerSettings {
    /// Derive breaker settings from the delivery configuration.
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            failure_threshold: config.circuit_failure_threshold.max(1),
            failure_window: config.circuit_failure_window(),
            cool_down: config.circuit_cooldown(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    window_started: Option<Instant>,
    last_transition: Instant,
    trial_in_flight: bool,
}

/// A single breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(key: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            key: key.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window_started: None,
                last_transition: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    /// Breaker key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state. The Open → HalfOpen transition happens lazily in [`allow`](Self::allow).
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures counted in the current window.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Ask permission to make a call.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] while open, or while half-open with the
    /// trial already taken.
    pub fn allow(&self) -> Result<(), CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = now.saturating_duration_since(inner.last_transition);
                if elapsed >= self.settings.cool_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_transition = now;
                    inner.trial_in_flight = true;
                    info!(key = %self.key, "circuit half-open; admitting trial call");
                    Ok(())
                } else {
                    Err(self.rejection(self.settings.cool_down.saturating_sub(elapsed)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.rejection(self.settings.cool_down))
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.window_started = None;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.window_started = None;
                inner.trial_in_flight = false;
                inner.last_transition = now;
                info!(key = %self.key, "circuit closed after successful trial call");
            }
            // A call admitted before the trip finished late; the cool-down stands.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                let window_expired = inner.window_started.is_some_and(|started| {
                    now.saturating_duration_since(started) > self.settings.failure_window
                });
                if window_expired || inner.window_started.is_none() {
                    inner.window_started = Some(now);
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_transition = now;
                    warn!(
                        key = %self.key,
                        failures = inner.consecutive_failures,
                        cool_down_secs = self.settings.cool_down.as_secs(),
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_transition = now;
                inner.trial_in_flight = false;
                warn!(key = %self.key, "trial call failed; circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    fn rejection(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            key: self.key.clone(),
            retry_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the breakers for one scope and hands out the right one per recipient.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    scope: CircuitScope,
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new(scope: CircuitScope, settings: BreakerSettings) -> Self {
        Self {
            scope,
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Build a registry from the delivery configuration.
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.circuit_scope, BreakerSettings::from_config(config))
    }

    /// Configured scope.
    pub fn scope(&self) -> CircuitScope {
        self.scope
    }

    /// Breaker key for a recipient address under the configured scope.
    pub fn key_for(&self, recipient: &str) -> String {
        match self.scope {
            CircuitScope::Provider => PROVIDER_SCOPE_KEY.to_owned(),
            CircuitScope::Domain => {
                super::recipient_domain(recipient).unwrap_or_else(|| "unknown".to_owned())
            }
        }
    }

    /// The breaker guarding sends to `recipient`, created on first use.
    pub fn breaker_for(&self, recipient: &str) -> Arc<CircuitBreaker> {
        let key = self.key_for(recipient);
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.settings))),
        )
    }

    /// Snapshot of every breaker's state, sorted by key.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.state()))
            .collect();
        states.sort();
        states
    }
}
