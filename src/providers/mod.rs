//! Email provider abstraction layer.
//!
//! Defines the [`ProviderClient`] trait and the shared request/response and
//! error types. Every provider error carries a retry classification
//! ([`ErrorClass`]) that the retry policy consumes.
//!
//! One provider is implemented:
//! - [`resend::ResendClient`]: Resend-compatible `POST /emails` API

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::delivery::{ErrorClass, OutgoingMessage};

pub mod resend;

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

/// A single send request handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Recipient, optionally with display name (`Name <addr>`).
    pub to: String,
    /// Sender header value.
    pub from: String,
    /// Subject line.
    pub subject: String,
    /// HTML body (may be empty).
    pub html_body: String,
    /// Plain-text body (may be empty).
    pub text_body: String,
    /// Key the provider may use to drop duplicate submissions.
    pub idempotency_key: Option<String>,
}

impl SendRequest {
    /// Build a request for an outgoing message, keyed by its dedup key.
    pub fn for_message(message: &OutgoingMessage, from: &str) -> Self {
        let to = match message.recipient_name() {
            Some(name) => format!("{name} <{}>", message.recipient()),
            None => message.recipient().to_owned(),
        };
        Self {
            to,
            from: from.to_owned(),
            subject: message.subject().to_owned(),
            html_body: message.html_body().to_owned(),
            text_body: message.text_body().to_owned(),
            idempotency_key: Some(message.dedup_key().to_owned()),
        }
    }
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReceipt {
    /// Provider-assigned message id.
    pub provider_message_id: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by email providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The call did not finish within the send timeout.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    /// Upstream provider responded with an error status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// Provider asked us to slow down (HTTP 429).
    #[error("provider rate limited the request: {body}")]
    RateLimited {
        /// Value of the `Retry-After` header, if present.
        retry_after: Option<Duration>,
        /// Sanitized response body.
        body: String,
    },
    /// Response did not match expected schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
    /// The request itself was unacceptable before reaching the provider.
    #[error("invalid send request: {0}")]
    InvalidRequest(String),
    /// Provider cannot be used with current configuration (e.g. missing API key).
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    /// The send task panicked or was torn down unexpectedly.
    #[error("provider call crashed: {0}")]
    Crashed(String),
}

impl ProviderError {
    /// Retry classification for this error.
    ///
    /// Anything not clearly permanent is transient; attempts stay bounded by
    /// the retry policy either way.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Request(e) if e.is_builder() => ErrorClass::Permanent,
            Self::HttpStatus { status, .. } => classify_status(*status),
            Self::InvalidRequest(_) | Self::NotConfigured(_) => ErrorClass::Permanent,
            Self::Request(_)
            | Self::Timeout(_)
            | Self::RateLimited { .. }
            | Self::Parse(_)
            | Self::Crashed(_) => ErrorClass::Transient,
        }
    }

    /// Provider-requested wait before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Classify an HTTP error status.
///
/// 429 and 5xx are transient. 408, 409 and 425 are transient because the
/// request may not have been processed. Other 4xx are permanent. Anything
/// else is ambiguous and treated as transient.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        408 | 409 | 425 | 429 => ErrorClass::Transient,
        400..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// Returns `ProviderError::Request` on transport failure,
/// `ProviderError::RateLimited` on 429 and `ProviderError::HttpStatus` on other non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await?;
    if status.as_u16() == 429 {
        return Err(ProviderError::RateLimited {
            retry_after,
            body: sanitize_http_error_body(&body),
        });
    }
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

/// Parse a `Retry-After` header given in delta-seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"re_[A-Za-z0-9_]{10,}",
        r"SG\.[A-Za-z0-9_\-\.]{20,}",
        r"key-[A-Za-z0-9]{20,}",
        r"Bearer [A-Za-z0-9_\-\.]{10,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Transactional email provider interface.
///
/// Implementations must be `Send + Sync` so one client can be shared by
/// every delivery worker.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Submit one message.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] whose [`class`](ProviderError::class)
    /// tells the retry policy whether the failure is worth retrying.
    async fn send(&self, request: &SendRequest) -> Result<ProviderReceipt, ProviderError>;

    /// Short provider name for logs and records.
    fn name(&self) -> &str;

    /// Sender header used for every message.
    fn from_header(&self) -> &str;

    /// Verify credentials and settings before a campaign starts.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotConfigured`] when the client cannot send.
    fn check_ready(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
