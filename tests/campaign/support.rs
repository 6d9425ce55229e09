//! Scripted collaborators shared by the campaign tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use campaigner::campaign::{CampaignConfig, DispatcherDeps};
use campaigner::config::DeliveryConfig;
use campaigner::delivery::circuit_breaker::{BreakerSettings, CircuitBreakerRegistry, CircuitScope};
use campaigner::delivery::quota::{QuotaPeriod, QuotaTracker};
use campaigner::delivery::rate_limiter::RateLimiter;
use campaigner::delivery::retry::RetryPolicy;
use campaigner::delivery::sink::{DeliveryRecordSink, InMemorySink, SinkError, WriteAck};
use campaigner::delivery::{DeliveryOutcome, OutgoingMessage};
use campaigner::providers::{ProviderClient, ProviderError, ProviderReceipt, SendRequest};

/// What the scripted provider answers for one call.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Accept,
    Status(u16),
    Crash,
}

/// Provider that answers from a per-recipient script and counts calls.
pub struct ScriptedProvider {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallback: Reply,
    latency: Duration,
    ready: bool,
}

impl ScriptedProvider {
    pub fn accepting() -> Self {
        Self::answering(Reply::Accept)
    }

    pub fn answering(fallback: Reply) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            scripts: Mutex::new(HashMap::new()),
            fallback,
            latency: Duration::ZERO,
            ready: true,
        }
    }

    pub fn with_script(self, recipient: &str, replies: &[Reply]) -> Self {
        self.scripts
            .lock()
            .expect("script lock")
            .insert(recipient.to_owned(), replies.iter().copied().collect());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, recipient: &str) -> Reply {
        self.scripts
            .lock()
            .expect("script lock")
            .get_mut(recipient)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.fallback)
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn send(&self, request: &SendRequest) -> Result<ProviderReceipt, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.next_reply(&request.to) {
            Reply::Accept => Ok(ProviderReceipt {
                provider_message_id: format!("msg_{call}"),
            }),
            Reply::Status(status) => Err(ProviderError::HttpStatus {
                status,
                body: format!("scripted {status}"),
            }),
            Reply::Crash => panic!("scripted provider crash for {}", request.to),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn from_header(&self) -> &str {
        "Campaigns <campaigns@example.com>"
    }

    fn check_ready(&self) -> Result<(), ProviderError> {
        if self.ready {
            Ok(())
        } else {
            Err(ProviderError::NotConfigured("missing API key".to_owned()))
        }
    }
}

/// Sink whose outcome writes always fail.
#[derive(Debug, Default)]
pub struct BrokenSink;

#[async_trait]
impl DeliveryRecordSink for BrokenSink {
    async fn write_outcome(
        &self,
        _campaign_id: &str,
        _recipient_key: &str,
        _outcome: &DeliveryOutcome,
    ) -> Result<WriteAck, SinkError> {
        Err(SinkError::Storage("disk full".to_owned()))
    }

    async fn existing_outcome(
        &self,
        _campaign_id: &str,
        _recipient_key: &str,
    ) -> Result<Option<DeliveryOutcome>, SinkError> {
        Ok(None)
    }
}

/// In-memory sink that panics on one recipient's suppression lookup or write.
#[derive(Debug, Default)]
pub struct PanickingSink {
    inner: InMemorySink,
    lookup_panics_for: Option<String>,
    write_panics_for: Option<String>,
}

impl PanickingSink {
    pub fn on_suppression_lookup(recipient: &str) -> Self {
        Self {
            lookup_panics_for: Some(recipient.to_owned()),
            ..Self::default()
        }
    }

    pub fn on_write(recipient: &str) -> Self {
        Self {
            write_panics_for: Some(recipient.to_owned()),
            ..Self::default()
        }
    }

    pub fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.inner.outcomes()
    }
}

#[async_trait]
impl DeliveryRecordSink for PanickingSink {
    async fn write_outcome(
        &self,
        campaign_id: &str,
        recipient_key: &str,
        outcome: &DeliveryOutcome,
    ) -> Result<WriteAck, SinkError> {
        if self.write_panics_for.as_deref() == Some(outcome.recipient.as_str()) {
            panic!("sink crashed writing {}", outcome.recipient);
        }
        self.inner
            .write_outcome(campaign_id, recipient_key, outcome)
            .await
    }

    async fn existing_outcome(
        &self,
        campaign_id: &str,
        recipient_key: &str,
    ) -> Result<Option<DeliveryOutcome>, SinkError> {
        self.inner.existing_outcome(campaign_id, recipient_key).await
    }

    async fn is_suppressed(&self, recipient: &str) -> Result<bool, SinkError> {
        if self.lookup_panics_for.as_deref() == Some(recipient) {
            panic!("sink crashed looking up {recipient}");
        }
        self.inner.is_suppressed(recipient).await
    }
}

pub fn breaker_settings(failure_threshold: u32) -> BreakerSettings {
    BreakerSettings {
        failure_threshold,
        failure_window: Duration::from_secs(60),
        cool_down: Duration::from_secs(10),
    }
}

/// Generous gates: only the quota ceiling is meant to bind.
pub fn deps(
    provider: Arc<ScriptedProvider>,
    sink: Arc<dyn DeliveryRecordSink>,
    quota: u32,
) -> DispatcherDeps {
    DispatcherDeps {
        provider,
        sink,
        rate_limiter: Arc::new(RateLimiter::new(1000.0, 1000, Duration::from_secs(60))),
        quota: Arc::new(QuotaTracker::new(quota, QuotaPeriod::Daily)),
        breakers: Arc::new(CircuitBreakerRegistry::new(
            CircuitScope::Provider,
            breaker_settings(1000),
        )),
    }
}

/// Five workers, three attempts, no jitter.
pub fn config(campaign_id: &str) -> CampaignConfig {
    CampaignConfig::from_delivery(campaign_id, &DeliveryConfig::default())
        .with_concurrency(5)
        .with_retry(
            RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(2)).with_jitter(0.0),
        )
        .with_dry_run(false)
}

pub fn recipient(i: usize) -> String {
    format!("user{i}@example.com")
}

pub fn messages(campaign_id: &str, count: usize) -> Vec<OutgoingMessage> {
    (0..count)
        .map(|i| {
            OutgoingMessage::new(
                campaign_id,
                recipient(i),
                "Spring sale",
                "<p>Hello</p>",
                "Hello",
            )
        })
        .collect()
}
