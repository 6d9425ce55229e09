//! Resend-compatible provider implementation using the `POST /emails` API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;

use super::{check_http_response, ProviderClient, ProviderError, ProviderReceipt, SendRequest};

const PROVIDER_NAME: &str = "resend";

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// `POST /emails` request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct ResendEmailRequest {
    /// Sender header value.
    pub from: String,
    /// Recipients.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// Plain-text body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// `POST /emails` success body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ResendEmailResponse {
    /// Provider message id.
    pub id: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Resend HTTP client.
#[derive(Clone)]
pub struct ResendClient {
    endpoint: String,
    api_key: Option<String>,
    from: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for ResendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResendClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl ResendClient {
    /// Create a client for `config`, authenticating with `api_key`.
    pub fn new(config: &ProviderConfig, api_key: Option<String>) -> Self {
        Self {
            endpoint: format!("{}/emails", config.base_url.trim_end_matches('/')),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            from: config.from_header(),
            client: reqwest::Client::new(),
        }
    }

    /// Full URL of the send endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// ---------------------------------------------------------------------------
// Request / Response builders (pub for integration testing)
// ---------------------------------------------------------------------------

/// Build the wire request for a send.
#[doc(hidden)]
pub fn build_request(request: &SendRequest) -> ResendEmailRequest {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_owned());
    ResendEmailRequest {
        from: request.from.clone(),
        to: vec![request.to.clone()],
        subject: request.subject.clone(),
        html: non_empty(&request.html_body),
        text: non_empty(&request.text_body),
    }
}

/// Parse a success body into a receipt.
///
/// # Errors
///
/// Returns `ProviderError::Parse` if the body has no message id.
#[doc(hidden)]
pub fn parse_response(body: &str) -> Result<ProviderReceipt, ProviderError> {
    let resp: ResendEmailResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
    if resp.id.trim().is_empty() {
        return Err(ProviderError::Parse("empty message id".to_owned()));
    }
    Ok(ProviderReceipt {
        provider_message_id: resp.id,
    })
}

// ---------------------------------------------------------------------------
// Trait impl
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderClient for ResendClient {
    async fn send(&self, request: &SendRequest) -> Result<ProviderReceipt, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured("missing API key".to_owned()))?;
        if request.html_body.is_empty() && request.text_body.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "message has neither HTML nor text body".to_owned(),
            ));
        }

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("authorization", format!("Bearer {api_key}"))
            .header("content-type", "application/json");
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("idempotency-key", key);
        }

        let response = builder.json(&build_request(request)).send().await?;
        let payload = check_http_response(response).await?;
        parse_response(&payload)
    }

    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn from_header(&self) -> &str {
        &self.from
    }

    fn check_ready(&self) -> Result<(), ProviderError> {
        if self.api_key.is_none() {
            return Err(ProviderError::NotConfigured("missing API key".to_owned()));
        }
        if !self.from.contains('@') {
            return Err(ProviderError::NotConfigured(format!(
                "sender {:?} is not an email address",
                self.from
            )));
        }
        Ok(())
    }
}
