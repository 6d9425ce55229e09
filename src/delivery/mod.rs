//! Delivery data model and the shared gates every send passes through.
//!
//! An [`OutgoingMessage`] is immutable once built and is shared between the
//! dispatcher and workers behind an `Arc`. Each try at sending it produces a
//! [`DeliveryAttempt`]; the terminal result is a [`DeliveryOutcome`], which is
//! what gets persisted and reported.
//!
//! The gates live in submodules:
//! - [`rate_limiter::RateLimiter`]: token bucket bounding calls per second
//! - [`circuit_breaker::CircuitBreaker`]: failure-tripped gate per provider or domain
//! - [`retry::RetryPolicy`]: transient/permanent decision with jittered backoff
//! - [`quota::QuotaTracker`]: hard ceiling on sends per wall-clock window
//! - [`sink::DeliveryRecordSink`]: idempotent outcome persistence

pub mod circuit_breaker;
pub mod quota;
pub mod rate_limiter;
pub mod retry;
pub mod sink;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use self::circuit_breaker::CircuitOpenError;
use self::rate_limiter::RateLimitTimeout;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One unit of work: a fully rendered message for a single recipient.
///
/// Fields are private so a message cannot change after its deduplication
/// key has been derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    campaign_id: String,
    recipient: String,
    recipient_name: Option<String>,
    subject: String,
    html_body: String,
    text_body: String,
    dedup_key: String,
}

impl OutgoingMessage {
    /// Build a message, deriving its deduplication key from campaign and recipient.
    pub fn new(
        campaign_id: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        html_body: impl Into<String>,
        text_body: impl Into<String>,
    ) -> Self {
        let campaign_id = campaign_id.into();
        let recipient = recipient.into().trim().to_owned();
        let dedup_key = dedup_key(&campaign_id, &recipient);
        Self {
            campaign_id,
            recipient,
            recipient_name: None,
            subject: subject.into(),
            html_body: html_body.into(),
            text_body: text_body.into(),
            dedup_key,
        }
    }

    /// Attach a display name for the `To` header.
    pub fn with_recipient_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.recipient_name = (!name.trim().is_empty()).then_some(name);
        self
    }

    /// Campaign this message belongs to.
    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    /// Recipient email address.
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Recipient display name, if known.
    pub fn recipient_name(&self) -> Option<&str> {
        self.recipient_name.as_deref()
    }

    /// Rendered subject line.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Rendered HTML body.
    pub fn html_body(&self) -> &str {
        &self.html_body
    }

    /// Rendered plain-text body.
    pub fn text_body(&self) -> &str {
        &self.text_body
    }

    /// Stable key identifying this (campaign, recipient) pair.
    pub fn dedup_key(&self) -> &str {
        &self.dedup_key
    }

    /// Domain part of the recipient address, lowercased.
    pub fn recipient_domain(&self) -> Option<String> {
        recipient_domain(&self.recipient)
    }
}

/// Derive the deduplication key for a campaign and recipient.
///
/// The address is trimmed and lowercased so case variants of the same
/// mailbox collapse onto one key.
pub fn dedup_key(campaign_id: &str, recipient: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(campaign_id.as_bytes());
    hasher.update([0_u8]);
    hasher.update(recipient.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercased domain of an email address, if it has one.
pub fn recipient_domain(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().to_lowercase())
        .filter(|domain| !domain.is_empty())
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retryable: network errors, timeouts, 429/5xx, rate signals.
    Transient,
    /// Not retryable: invalid recipient, rejected content, 4xx validation errors.
    Permanent,
}

impl ErrorClass {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// The attempt has started but not resolved.
    Pending,
    /// The provider accepted the message.
    Success,
    /// The attempt failed in a retryable way.
    TransientFailure,
    /// The attempt failed in a non-retryable way.
    PermanentFailure,
}

/// Error detail retained on a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    /// Retry classification.
    pub class: ErrorClass,
    /// Human-readable reason.
    pub message: String,
}

/// One try at sending an [`OutgoingMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Attempt number, starting at 1.
    pub number: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Resolution of the attempt.
    pub status: AttemptStatus,
    /// Provider-assigned id on success.
    pub provider_message_id: Option<String>,
    /// Failure detail.
    pub error: Option<AttemptError>,
    /// Provider-requested minimum wait before the next try.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl DeliveryAttempt {
    /// Start a new pending attempt.
    pub fn begin(number: u32) -> Self {
        Self {
            number,
            started_at: Utc::now(),
            status: AttemptStatus::Pending,
            provider_message_id: None,
            error: None,
            retry_after: None,
        }
    }

    /// Resolve the attempt as accepted by the provider.
    pub fn succeed(mut self, provider_message_id: impl Into<String>) -> Self {
        self.status = AttemptStatus::Success;
        self.provider_message_id = Some(provider_message_id.into());
        self
    }

    /// Resolve the attempt as failed with the given classification.
    pub fn fail(mut self, class: ErrorClass, message: impl Into<String>) -> Self {
        self.status = match class {
            ErrorClass::Transient => AttemptStatus::TransientFailure,
            ErrorClass::Permanent => AttemptStatus::PermanentFailure,
        };
        self.error = Some(AttemptError {
            class,
            message: message.into(),
        });
        self
    }

    /// Record a provider-requested wait before the next try.
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Accepted by the provider (or synthesized in dry-run).
    Delivered,
    /// Permanent failure or retries exhausted.
    Failed,
    /// Never sent: quota, open circuit, cancellation, or suppression.
    Skipped,
}

impl OutcomeStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Why a message was skipped without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The quota window had no budget left.
    QuotaExhausted,
    /// The breaker stayed open past the deferral limit.
    CircuitOpen,
    /// The campaign was cancelled before this message was sent.
    Cancelled,
    /// The recipient is on the suppression list.
    Suppressed,
}

impl SkipReason {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuotaExhausted => "quota_exhausted",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::Suppressed => "suppressed",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quota_exhausted" => Some(Self::QuotaExhausted),
            "circuit_open" => Some(Self::CircuitOpen),
            "cancelled" => Some(Self::Cancelled),
            "suppressed" => Some(Self::Suppressed),
            _ => None,
        }
    }
}

/// The final, terminal result for an [`OutgoingMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Campaign identifier.
    pub campaign_id: String,
    /// Deduplication key of the message.
    pub dedup_key: String,
    /// Recipient address.
    pub recipient: String,
    /// Terminal status.
    pub status: OutcomeStatus,
    /// Set when `status` is [`OutcomeStatus::Skipped`].
    pub skip_reason: Option<SkipReason>,
    /// Number of attempts made, including ones refused by the rate limiter.
    pub attempts: u32,
    /// Provider-assigned id when delivered.
    pub provider_message_id: Option<String>,
    /// Last error seen, retained on failure.
    pub last_error: Option<AttemptError>,
    /// Wall time from first pickup to resolution.
    pub latency: Duration,
    /// When the outcome was decided.
    pub finished_at: DateTime<Utc>,
    /// Every attempt made, in order.
    pub history: Vec<DeliveryAttempt>,
}

impl DeliveryOutcome {
    /// Build an outcome from the attempt history of a message.
    ///
    /// The last attempt decides the provider id and error fields.
    pub fn from_history(
        message: &OutgoingMessage,
        status: OutcomeStatus,
        skip_reason: Option<SkipReason>,
        history: Vec<DeliveryAttempt>,
        latency: Duration,
    ) -> Self {
        let last = history.last();
        let provider_message_id = last.and_then(|a| a.provider_message_id.clone());
        let last_error = history.iter().rev().find_map(|a| a.error.clone());
        Self {
            campaign_id: message.campaign_id().to_owned(),
            dedup_key: message.dedup_key().to_owned(),
            recipient: message.recipient().to_owned(),
            status,
            skip_reason,
            attempts: u32::try_from(history.len()).unwrap_or(u32::MAX),
            provider_message_id,
            last_error,
            latency,
            finished_at: Utc::now(),
            history,
        }
    }

    /// Build a skipped outcome.
    pub fn skipped(
        message: &OutgoingMessage,
        reason: SkipReason,
        history: Vec<DeliveryAttempt>,
        latency: Duration,
    ) -> Self {
        Self::from_history(message, OutcomeStatus::Skipped, Some(reason), history, latency)
    }

    /// Whether the message reached the provider successfully.
    pub fn is_delivered(&self) -> bool {
        self.status == OutcomeStatus::Delivered
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error taxonomy for a single send.
///
/// Per-message errors never escape a worker; they are resolved into a
/// [`DeliveryOutcome`]. Only [`DeliveryError::Configuration`] aborts a run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// Retryable provider failure (timeout, 5xx, rate signal).
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Non-retryable provider failure (invalid recipient, rejected content).
    #[error("permanent provider error: {0}")]
    PermanentProvider(String),

    /// No budget left in the current quota window.
    #[error("quota exceeded: {used} of {ceiling} sends used in current window")]
    QuotaExceeded {
        /// Sends already counted in the window.
        used: u32,
        /// Window ceiling.
        ceiling: u32,
    },

    /// A circuit breaker rejected the call.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The rate limiter could not grant a slot within the maximum wait.
    #[error(transparent)]
    RateLimitTimeout(#[from] RateLimitTimeout),

    /// Invalid configuration or missing credentials.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DeliveryError {
    /// Retry classification, for errors that describe a send failure.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::TransientProvider(_) | Self::RateLimitTimeout(_) => Some(ErrorClass::Transient),
            Self::PermanentProvider(_) => Some(ErrorClass::Permanent),
            Self::QuotaExceeded { .. } | Self::CircuitOpen(_) | Self::Configuration(_) => None,
        }
    }
}
