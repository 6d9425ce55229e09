//! Bounded worker pool and the per-message delivery state machine.
//!
//! ```text
//!   queued ──▶ attempt ──┬──▶ terminal (delivered | failed | skipped)
//!     ▲                  │
//!     └──── scheduler ◀──┴── retry scheduled (backoff or circuit deferral)
//! ```
//!
//! Workers share one input queue. A message that needs another try is handed
//! to the scheduler task, which keeps it in a timer queue and re-enqueues it
//! when due, so no worker sleeps through a backoff. The pool never decides
//! when a campaign is finished: the dispatcher counts resolutions and calls
//! [`DeliveryWorkerPool::shutdown`] once every message has one.
//!
//! Each pass over a message and each outcome write runs on its own task. A
//! panic in either is contained: a crashed pass counts as a transient attempt
//! and goes through the retry policy, a crashed write is reported like any
//! other sink failure. A worker task that dies anyway is replaced.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::delivery::circuit_breaker::CircuitBreaker;
use crate::delivery::retry::RetryDecision;
use crate::delivery::sink::WriteAck;
use crate::delivery::{
    DeliveryAttempt, DeliveryError, DeliveryOutcome, ErrorClass, OutcomeStatus, OutgoingMessage,
    SkipReason,
};
use crate::providers::{ProviderError, SendRequest};

use super::{CampaignConfig, DispatcherDeps};

/// Terminal result of one message, reported back to the dispatcher.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The outcome that was (or should have been) persisted.
    pub outcome: DeliveryOutcome,
    /// Set when the sink failed to record the outcome.
    pub sink_error: Option<String>,
}

/// The pool no longer accepts messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("delivery worker pool is closed")]
pub struct PoolClosed;

#[derive(Debug, Clone)]
struct WorkItem {
    message: Arc<OutgoingMessage>,
    history: Vec<DeliveryAttempt>,
    deferrals: u32,
    picked_up: Option<Instant>,
}

impl WorkItem {
    fn new(message: OutgoingMessage) -> Self {
        Self {
            message: Arc::new(message),
            history: Vec::new(),
            deferrals: 0,
            picked_up: None,
        }
    }

    fn next_attempt_number(&self) -> u32 {
        u32::try_from(self.history.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1)
    }

    fn latency(&self) -> Duration {
        self.picked_up.map_or(Duration::ZERO, |at| at.elapsed())
    }

    fn resolve(self, status: OutcomeStatus) -> DeliveryOutcome {
        let latency = self.latency();
        DeliveryOutcome::from_history(&self.message, status, None, self.history, latency)
    }

    fn skip(self, reason: SkipReason) -> DeliveryOutcome {
        let latency = self.latency();
        DeliveryOutcome::skipped(&self.message, reason, self.history, latency)
    }
}

/// What a worker does with a message after one pass.
enum Step {
    Terminal(DeliveryOutcome),
    Retry { item: WorkItem, delay: Duration },
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Fixed-size set of delivery workers draining one shared queue.
pub struct DeliveryWorkerPool {
    queue: mpsc::UnboundedSender<WorkItem>,
    resolutions: mpsc::UnboundedReceiver<Resolution>,
    shutdown: watch::Sender<bool>,
    workers: JoinSet<()>,
    spare: Worker,
    next_worker_id: usize,
    scheduler: JoinHandle<()>,
}

impl fmt::Debug for DeliveryWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryWorkerPool")
            .field("campaign_id", &self.spare.config.campaign_id)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl DeliveryWorkerPool {
    /// Spawn `config.concurrency` workers plus the retry scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: Arc<CampaignConfig>,
        deps: DispatcherDeps,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (resolution_tx, resolution_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let concurrency = config.concurrency.max(1);
        let spare = Worker {
            id: 0,
            config: Arc::clone(&config),
            deps,
            queue: queue_rx,
            retries: retry_tx,
            resolutions: resolution_tx,
            cancel: cancel.clone(),
        };
        let mut workers = JoinSet::new();
        for id in 0..concurrency {
            workers.spawn(spare.with_id(id).run());
        }
        let scheduler = tokio::spawn(run_scheduler(
            retry_rx,
            queue_tx.clone(),
            cancel,
            shutdown_rx,
        ));

        info!(
            campaign_id = %config.campaign_id,
            concurrency,
            dry_run = config.dry_run,
            "delivery worker pool started"
        );
        Self {
            queue: queue_tx,
            resolutions: resolution_rx,
            shutdown: shutdown_tx,
            workers,
            spare,
            next_worker_id: concurrency,
            scheduler,
        }
    }

    /// Enqueue a message for its first attempt.
    ///
    /// # Errors
    ///
    /// Returns [`PoolClosed`] if every worker has stopped.
    pub fn submit(&self, message: OutgoingMessage) -> Result<(), PoolClosed> {
        self.queue
            .send(WorkItem::new(message))
            .map_err(|_| PoolClosed)
    }

    /// Wait for the next terminal outcome.
    ///
    /// A worker that died from a panic is replaced while waiting. Returns
    /// `None` only if every worker has stopped.
    pub async fn next_resolution(&mut self) -> Option<Resolution> {
        loop {
            tokio::select! {
                biased;
                resolution = self.resolutions.recv() => return resolution,
                exited = self.workers.join_next() => match exited {
                    None => return None,
                    Some(Err(err)) if err.is_panic() => {
                        let id = self.next_worker_id;
                        self.next_worker_id = id.saturating_add(1);
                        error!(worker = id, error = %err, "delivery worker died; starting a replacement");
                        self.workers.spawn(self.spare.with_id(id).run());
                    }
                    Some(_) => {}
                },
            }
        }
    }

    /// Stop the scheduler and workers and wait for them to exit.
    ///
    /// Call once every submitted message has resolved; anything still
    /// scheduled for retry at this point is dropped.
    pub async fn shutdown(self) {
        let Self {
            queue,
            resolutions,
            shutdown,
            mut workers,
            spare,
            scheduler,
            ..
        } = self;
        shutdown.send_replace(true);
        drop(queue);
        drop(resolutions);
        drop(spare);

        if let Err(err) = scheduler.await {
            error!(error = %err, "retry scheduler task failed");
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "delivery worker task failed");
            }
        }
        debug!("delivery worker pool stopped");
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Worker {
    id: usize,
    config: Arc<CampaignConfig>,
    deps: DispatcherDeps,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    retries: mpsc::UnboundedSender<RetryRequest>,
    resolutions: mpsc::UnboundedSender<Resolution>,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    fn with_id(&self, id: usize) -> Self {
        Self { id, ..self.clone() }
    }

    async fn run(self) {
        debug!(worker = self.id, "delivery worker started");
        while let Some(item) = self.next_item().await {
            match self.process_isolated(item).await {
                Step::Terminal(outcome) => self.finalize(outcome).await,
                Step::Retry { item, delay } => self.schedule(item, delay).await,
            }
        }
        debug!(worker = self.id, "delivery worker stopped");
    }

    async fn next_item(&self) -> Option<WorkItem> {
        self.queue.lock().await.recv().await
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run one pass on its own task so a panic resolves into a transient attempt.
    async fn process_isolated(&self, mut item: WorkItem) -> Step {
        item.picked_up.get_or_insert_with(Instant::now);
        let checkpoint = item.clone();
        let mut worker = self.clone();
        match tokio::spawn(async move { worker.process(item).await }).await {
            Ok(step) => step,
            Err(join_error) => {
                error!(
                    worker = self.id,
                    recipient = checkpoint.message.recipient(),
                    error = %join_error,
                    "delivery step crashed"
                );
                let attempt = DeliveryAttempt::begin(checkpoint.next_attempt_number()).fail(
                    ErrorClass::Transient,
                    format!("delivery step crashed: {join_error}"),
                );
                self.after_attempt(checkpoint, attempt)
            }
        }
    }

    /// One pass of the state machine: gates, provider call, retry decision.
    async fn process(&mut self, mut item: WorkItem) -> Step {
        let message = Arc::clone(&item.message);

        if self.is_cancelled() {
            return Step::Terminal(item.skip(SkipReason::Cancelled));
        }
        if self.config.dry_run {
            return Step::Terminal(dry_run_outcome(item));
        }
        if item.history.is_empty() && item.deferrals == 0 && self.is_suppressed(&message).await {
            debug!(recipient = message.recipient(), "recipient suppressed");
            return Step::Terminal(item.skip(SkipReason::Suppressed));
        }

        let quota = Arc::clone(&self.deps.quota);
        let Some(hold) = quota.hold(1) else {
            debug!(recipient = message.recipient(), "quota exhausted; skipping");
            return Step::Terminal(item.skip(SkipReason::QuotaExhausted));
        };

        let acquired = tokio::select! {
            result = self.deps.rate_limiter.acquire(1) => Some(result),
            Ok(_) = self.cancel.wait_for(|cancelled| *cancelled) => None,
        };
        match acquired {
            None => return Step::Terminal(item.skip(SkipReason::Cancelled)),
            Some(Err(timeout)) => {
                drop(hold);
                let attempt = DeliveryAttempt::begin(item.next_attempt_number())
                    .fail(ErrorClass::Transient, DeliveryError::from(timeout).to_string());
                return self.after_attempt(item, attempt);
            }
            Some(Ok(())) => {}
        }

        let breaker = self.deps.breakers.breaker_for(message.recipient());
        if let Err(open) = breaker.allow() {
            drop(hold);
            item.deferrals = item.deferrals.saturating_add(1);
            if item.deferrals > self.config.circuit_max_deferrals {
                warn!(
                    recipient = message.recipient(),
                    breaker = %open.key,
                    deferrals = item.deferrals,
                    "circuit stayed open; skipping"
                );
                return Step::Terminal(item.skip(SkipReason::CircuitOpen));
            }
            debug!(
                recipient = message.recipient(),
                breaker = %open.key,
                retry_after_ms = u64::try_from(open.retry_after.as_millis()).unwrap_or(u64::MAX),
                "circuit open; deferring"
            );
            return Step::Retry {
                item,
                delay: open.retry_after,
            };
        }

        let attempt = self
            .attempt(&message, item.next_attempt_number(), &breaker)
            .await;
        hold.commit();
        self.after_attempt(item, attempt)
    }

    async fn is_suppressed(&self, message: &OutgoingMessage) -> bool {
        match self.deps.sink.is_suppressed(message.recipient()).await {
            Ok(suppressed) => suppressed,
            Err(err) => {
                warn!(
                    recipient = message.recipient(),
                    error = %err,
                    "suppression lookup failed; treating recipient as not suppressed"
                );
                false
            }
        }
    }

    /// Call the provider on a separate task so a panic cannot take the worker down.
    async fn attempt(
        &self,
        message: &OutgoingMessage,
        number: u32,
        breaker: &CircuitBreaker,
    ) -> DeliveryAttempt {
        let attempt = DeliveryAttempt::begin(number);
        let provider = Arc::clone(&self.deps.provider);
        let request = SendRequest::for_message(message, provider.from_header());
        let timeout = self.config.send_timeout;

        let call = tokio::spawn(async move {
            tokio::time::timeout(timeout, provider.send(&request)).await
        });
        let result = match call.await {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(ProviderError::Timeout(timeout)),
            Err(join_error) => Err(ProviderError::Crashed(join_error.to_string())),
        };

        match result {
            Ok(receipt) => {
                breaker.record_success();
                debug!(
                    recipient = message.recipient(),
                    attempt = number,
                    provider_message_id = %receipt.provider_message_id,
                    "message accepted"
                );
                attempt.succeed(receipt.provider_message_id)
            }
            Err(err) => {
                let class = err.class();
                match class {
                    ErrorClass::Transient => breaker.record_failure(),
                    // The provider answered; a rejected message says nothing about its health.
                    ErrorClass::Permanent => breaker.record_success(),
                }
                debug!(
                    recipient = message.recipient(),
                    attempt = number,
                    class = class.as_str(),
                    error = %err,
                    "send attempt failed"
                );
                let retry_after = err.retry_after();
                attempt.fail(class, err.to_string()).with_retry_after(retry_after)
            }
        }
    }

    fn after_attempt(&self, mut item: WorkItem, attempt: DeliveryAttempt) -> Step {
        let decision = self.config.retry.decide(&attempt);
        item.history.push(attempt);
        match decision {
            RetryDecision::Succeed => Step::Terminal(item.resolve(OutcomeStatus::Delivered)),
            RetryDecision::FailPermanently => {
                let exhausted = item
                    .history
                    .last()
                    .and_then(|attempt| attempt.error.as_ref())
                    .is_some_and(|error| error.class == ErrorClass::Transient);
                if exhausted {
                    warn!(
                        recipient = item.message.recipient(),
                        attempts = item.history.len(),
                        "retries exhausted"
                    );
                }
                Step::Terminal(item.resolve(OutcomeStatus::Failed))
            }
            RetryDecision::RetryAfter(delay) => Step::Retry { item, delay },
        }
    }

    async fn schedule(&self, item: WorkItem, delay: Duration) {
        let now = Instant::now();
        let due = now.checked_add(delay).unwrap_or(now);
        if let Err(mpsc::error::SendError(request)) = self.retries.send(RetryRequest { due, item }) {
            warn!(
                recipient = request.item.message.recipient(),
                "retry scheduler stopped; failing message"
            );
            self.finalize(request.item.resolve(OutcomeStatus::Failed))
                .await;
        }
    }

    async fn finalize(&self, outcome: DeliveryOutcome) {
        let sink_error = if self.config.dry_run {
            None
        } else {
            self.persist(&outcome).await
        };
        debug!(
            worker = self.id,
            recipient = %outcome.recipient,
            status = outcome.status.as_str(),
            attempts = outcome.attempts,
            "message resolved"
        );
        if self
            .resolutions
            .send(Resolution {
                outcome,
                sink_error,
            })
            .is_err()
        {
            warn!(worker = self.id, "dispatcher stopped listening for outcomes");
        }
    }
}

impl Worker {
    /// Write the outcome on its own task; returns the failure reason, if any.
    async fn persist(&self, outcome: &DeliveryOutcome) -> Option<String> {
        let sink = Arc::clone(&self.deps.sink);
        let campaign_id = self.config.campaign_id.clone();
        let record = outcome.clone();
        let write = tokio::spawn(async move {
            sink.write_outcome(&campaign_id, &record.dedup_key, &record)
                .await
        });
        match write.await {
            Ok(Ok(WriteAck::Recorded)) => None,
            Ok(Ok(WriteAck::Duplicate)) => {
                debug!(dedup_key = %outcome.dedup_key, "outcome already recorded");
                None
            }
            Ok(Err(err)) => {
                error!(
                    dedup_key = %outcome.dedup_key,
                    error = %err,
                    "failed to persist delivery outcome"
                );
                Some(err.to_string())
            }
            Err(join_error) => {
                error!(
                    dedup_key = %outcome.dedup_key,
                    error = %join_error,
                    "outcome write crashed"
                );
                Some(format!("outcome write crashed: {join_error}"))
            }
        }
    }
}

fn dry_run_outcome(mut item: WorkItem) -> DeliveryOutcome {
    let key_prefix: String = item.message.dedup_key().chars().take(16).collect();
    let attempt = DeliveryAttempt::begin(item.next_attempt_number())
        .succeed(format!("dry-run-{key_prefix}"));
    item.history.push(attempt);
    item.resolve(OutcomeStatus::Delivered)
}

// ---------------------------------------------------------------------------
// Retry scheduler
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RetryRequest {
    due: Instant,
    item: WorkItem,
}

/// Timer queue entry; ordered so the earliest `due` pops first from a max-heap.
#[derive(Debug)]
struct Scheduled {
    due: Instant,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Hold retry-scheduled messages until due, then put them back on the queue.
///
/// On cancellation every held message is released immediately so workers
/// can resolve it as cancelled.
async fn run_scheduler(
    mut requests: mpsc::UnboundedReceiver<RetryRequest>,
    queue: mpsc::UnboundedSender<WorkItem>,
    mut cancel: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timers: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut seq: u64 = 0;
    let mut cancel_open = true;

    loop {
        let cancelled = *cancel.borrow();
        if cancelled {
            while let Some(entry) = timers.pop() {
                forward(&queue, entry.item);
            }
        }
        let next_due = timers.peek().map(|entry| entry.due);

        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else { break };
                if cancelled {
                    forward(&queue, request.item);
                } else {
                    seq = seq.wrapping_add(1);
                    timers.push(Scheduled { due: request.due, seq, item: request.item });
                }
            }
            () = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let now = Instant::now();
                while timers.peek().is_some_and(|entry| entry.due <= now) {
                    if let Some(entry) = timers.pop() {
                        forward(&queue, entry.item);
                    }
                }
            }
            changed = cancel.changed(), if !cancelled && cancel_open => {
                if changed.is_err() {
                    cancel_open = false;
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }

    if !timers.is_empty() {
        warn!(pending = timers.len(), "retry scheduler stopped with messages still scheduled");
    }
    debug!("retry scheduler stopped");
}

fn forward(queue: &mpsc::UnboundedSender<WorkItem>, item: WorkItem) {
    if let Err(mpsc::error::SendError(item)) = queue.send(item) {
        warn!(
            recipient = item.message.recipient(),
            "delivery queue closed; dropping scheduled message"
        );
    }
}
