//! Campaign orchestration.
//!
//! A [`CampaignDispatcher`] runs one campaign as a short-lived state machine:
//!
//! ```text
//!   Initializing ──▶ Running ──▶ Draining ──▶ Completed
//!        │
//!        └──(configuration error)──▶ Aborted
//! ```
//!
//! Shared gates (rate limiter, quota, breakers) are owned by the caller and
//! passed in through [`DispatcherDeps`], so several dispatchers in one
//! process can share a single rate limit and quota.

pub mod compose;
pub mod pool;
pub mod summary;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DeliveryConfig;
use crate::delivery::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::delivery::quota::QuotaTracker;
use crate::delivery::rate_limiter::RateLimiter;
use crate::delivery::retry::RetryPolicy;
use crate::delivery::sink::{DeliveryRecordSink, SinkError};
use crate::delivery::{DeliveryOutcome, OutgoingMessage};
use crate::providers::ProviderClient;

use self::pool::DeliveryWorkerPool;
use self::summary::{CampaignSummary, SummaryBuilder};

// ---------------------------------------------------------------------------
// Configuration and collaborators
// ---------------------------------------------------------------------------

/// Per-run settings for one campaign.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    /// Campaign identifier; part of every deduplication key.
    pub campaign_id: String,
    /// Number of concurrent delivery workers.
    pub concurrency: usize,
    /// Retry policy applied to every message.
    pub retry: RetryPolicy,
    /// Upper bound on a single provider call.
    pub send_timeout: Duration,
    /// Circuit-open deferrals allowed before a message is skipped.
    pub circuit_max_deferrals: u32,
    /// Synthesize deliveries without touching the provider, quota or limiter.
    pub dry_run: bool,
    delivery_problems: Vec<String>,
}

impl CampaignConfig {
    /// Settings for `campaign_id` taken from the delivery configuration.
    pub fn from_delivery(campaign_id: impl Into<String>, delivery: &DeliveryConfig) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            concurrency: delivery.concurrency,
            retry: RetryPolicy::from_config(delivery),
            send_timeout: delivery.send_timeout(),
            circuit_max_deferrals: delivery.circuit_max_deferrals,
            dry_run: delivery.dry_run,
            delivery_problems: delivery.validate(),
        }
    }

    /// Override dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Override the worker count.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Human-readable problems that prevent a run, including those of the
    /// delivery configuration this was built from.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.delivery_problems.clone();
        if self.campaign_id.trim().is_empty() {
            problems.push("campaign id must not be empty".to_owned());
        }
        if self.concurrency == 0 {
            problems.push("concurrency must be at least 1".to_owned());
        }
        if self.send_timeout.is_zero() {
            problems.push("send timeout must be positive".to_owned());
        }
        problems
    }
}

/// Shared collaborators handed to the dispatcher and its workers.
#[derive(Clone)]
pub struct DispatcherDeps {
    /// Email provider client.
    pub provider: Arc<dyn ProviderClient>,
    /// Outcome persistence.
    pub sink: Arc<dyn DeliveryRecordSink>,
    /// Process-wide rate limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Process-wide send quota.
    pub quota: Arc<QuotaTracker>,
    /// Circuit breakers by provider or domain.
    pub breakers: Arc<CircuitBreakerRegistry>,
}

impl DispatcherDeps {
    /// Build fresh gates from configuration around a provider and sink.
    pub fn from_config(
        delivery: &DeliveryConfig,
        provider: Arc<dyn ProviderClient>,
        sink: Arc<dyn DeliveryRecordSink>,
    ) -> Self {
        Self {
            provider,
            sink,
            rate_limiter: Arc::new(RateLimiter::from_config(delivery)),
            quota: Arc::new(QuotaTracker::from_config(delivery)),
            breakers: Arc::new(CircuitBreakerRegistry::from_config(delivery)),
        }
    }

    /// Problems with the shared gates that would make a real run meaningless.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.quota.ceiling() == 0 {
            problems.push("quota ceiling must be at least 1".to_owned());
        }
        problems
    }
}

// ---------------------------------------------------------------------------
// State, cancellation and progress
// ---------------------------------------------------------------------------

/// Lifecycle of a campaign run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CampaignState {
    /// Validating configuration and priming shared state.
    Initializing,
    /// Feeding messages into the worker pool.
    Running,
    /// Waiting for in-flight and retry-scheduled messages.
    Draining,
    /// Every message has a terminal outcome.
    Completed,
    /// Setup failed; nothing was sent.
    Aborted,
}

impl CampaignState {
    /// Returns the lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    /// Whether the run has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Cooperative cancellation for a running campaign.
///
/// Cancelling stops new sends from starting. Provider calls already in
/// flight are allowed to finish; everything else resolves as skipped.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    /// Create an un-cancelled handle.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.tx.send_replace(true) {
            info!("campaign cancellation requested");
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Receives every terminal outcome as it happens, for live progress.
pub trait ProgressObserver: Send + Sync {
    /// Called once per message resolved during this run.
    fn on_outcome(&self, outcome: &DeliveryOutcome);
}

impl<F> ProgressObserver for F
where
    F: Fn(&DeliveryOutcome) + Send + Sync,
{
    fn on_outcome(&self, outcome: &DeliveryOutcome) {
        self(outcome);
    }
}

/// Errors that abort a campaign before any send.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    /// Invalid settings, duplicate messages, or an unusable provider.
    #[error("campaign configuration error: {0}")]
    Configuration(String),

    /// The record sink failed while preparing the run.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Runs one campaign from a batch of rendered messages to a summary.
pub struct CampaignDispatcher {
    config: Arc<CampaignConfig>,
    deps: DispatcherDeps,
    observer: Option<Arc<dyn ProgressObserver>>,
    cancel: CancelHandle,
    state: watch::Sender<CampaignState>,
}

struct Prepared {
    pending: Vec<OutgoingMessage>,
    summary: SummaryBuilder,
}

impl CampaignDispatcher {
    /// Create a dispatcher in the `Initializing` state.
    pub fn new(config: CampaignConfig, deps: DispatcherDeps) -> Self {
        let (state, _rx) = watch::channel(CampaignState::Initializing);
        Self {
            config: Arc::new(config),
            deps,
            observer: None,
            cancel: CancelHandle::new(),
            state,
        }
    }

    /// Register a progress observer.
    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Handle that cancels this campaign from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CampaignState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<CampaignState> {
        self.state.subscribe()
    }

    /// Deliver `messages` and return the campaign summary.
    ///
    /// Per-message failures never surface here; they become outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError`] when setup fails. The state is then
    /// `Aborted` and no message has been sent.
    pub async fn run(self, messages: Vec<OutgoingMessage>) -> Result<CampaignSummary, CampaignError> {
        let started = Instant::now();
        self.transition(CampaignState::Initializing);

        let Prepared {
            pending,
            mut summary,
        } = match self.initialize(messages).await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(
                    campaign_id = %self.config.campaign_id,
                    error = %err,
                    "campaign aborted during initialization"
                );
                self.transition(CampaignState::Aborted);
                return Err(err);
            }
        };

        self.transition(CampaignState::Running);
        let mut pool = DeliveryWorkerPool::start(
            Arc::clone(&self.config),
            self.deps.clone(),
            self.cancel.subscribe(),
        );
        let mut expected: usize = 0;
        for message in pending {
            if pool.submit(message).is_err() {
                error!(campaign_id = %self.config.campaign_id, "worker pool closed while feeding");
                break;
            }
            expected = expected.saturating_add(1);
        }

        self.transition(CampaignState::Draining);
        let mut resolved: usize = 0;
        while resolved < expected {
            let Some(resolution) = pool.next_resolution().await else {
                error!(
                    campaign_id = %self.config.campaign_id,
                    unresolved = expected.saturating_sub(resolved),
                    "worker pool stopped before every message resolved"
                );
                break;
            };
            resolved = resolved.saturating_add(1);

            if let Some(reason) = &resolution.sink_error {
                debug!(dedup_key = %resolution.outcome.dedup_key, reason, "outcome not persisted");
                summary.record_unpersisted();
            }
            if !self.config.dry_run {
                if let Err(err) = self
                    .deps
                    .sink
                    .save_quota_window(&self.deps.quota.snapshot())
                    .await
                {
                    warn!(error = %err, "failed to persist quota window");
                }
            }
            if let Some(observer) = &self.observer {
                observer.on_outcome(&resolution.outcome);
            }
            summary.record(&resolution.outcome);
        }
        pool.shutdown().await;

        let summary = summary.finish(started.elapsed());
        self.transition(CampaignState::Completed);
        info!(
            campaign_id = %summary.campaign_id,
            total = summary.total,
            delivered = summary.delivered,
            failed = summary.failed,
            skipped = summary.skipped,
            resumed = summary.resumed,
            duration_ms = u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
            "campaign completed"
        );
        Ok(summary)
    }

    async fn initialize(&self, messages: Vec<OutgoingMessage>) -> Result<Prepared, CampaignError> {
        let mut problems = self.config.validate();
        if !self.config.dry_run {
            problems.extend(self.deps.validate());
        }
        if !problems.is_empty() {
            return Err(CampaignError::Configuration(problems.join("; ")));
        }

        let mut seen = HashSet::with_capacity(messages.len());
        for message in &messages {
            if message.campaign_id() != self.config.campaign_id {
                return Err(CampaignError::Configuration(format!(
                    "message for {} belongs to campaign {}",
                    message.recipient(),
                    message.campaign_id()
                )));
            }
            if !seen.insert(message.dedup_key()) {
                return Err(CampaignError::Configuration(format!(
                    "duplicate recipient {}",
                    message.recipient()
                )));
            }
        }

        let mut summary =
            SummaryBuilder::new(&self.config.campaign_id, messages.len(), self.config.dry_run);
        if self.config.dry_run {
            info!(
                campaign_id = %self.config.campaign_id,
                messages = messages.len(),
                "dry run: provider, quota and rate limiter are bypassed"
            );
            return Ok(Prepared {
                pending: messages,
                summary,
            });
        }

        self.deps
            .provider
            .check_ready()
            .map_err(|err| CampaignError::Configuration(err.to_string()))?;

        let window_start = self.deps.quota.period().window_start(Utc::now());
        if let Some(stored) = self.deps.sink.load_quota_window(window_start).await? {
            self.deps.quota.restore(&stored);
        }

        for (key, state) in self.deps.breakers.states() {
            if state != CircuitState::Closed {
                warn!(key, state = ?state, "circuit not closed at campaign start");
            }
        }

        let mut pending = Vec::with_capacity(messages.len());
        for message in messages {
            match self
                .deps
                .sink
                .existing_outcome(&self.config.campaign_id, message.dedup_key())
                .await?
            {
                Some(outcome) => summary.record_resumed(&outcome),
                None => pending.push(message),
            }
        }

        let resumed = summary.resumed();
        info!(
            campaign_id = %self.config.campaign_id,
            pending = pending.len(),
            resumed,
            quota_remaining = self.deps.quota.remaining(),
            provider = self.deps.provider.name(),
            "campaign initialized"
        );
        Ok(Prepared { pending, summary })
    }

    fn transition(&self, next: CampaignState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                campaign_id = %self.config.campaign_id,
                from = previous.as_str(),
                to = next.as_str(),
                "campaign state changed"
            );
        }
    }
}

/// Run a campaign to completion without observers or cancellation.
///
/// # Errors
///
/// Returns [`CampaignError`] when setup fails.
pub async fn run_campaign(
    config: CampaignConfig,
    deps: DispatcherDeps,
    messages: Vec<OutgoingMessage>,
) -> Result<CampaignSummary, CampaignError> {
    CampaignDispatcher::new(config, deps).run(messages).await
}
