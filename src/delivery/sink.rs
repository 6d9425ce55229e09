//! Narrow write interface for persisting terminal outcomes.
//!
//! Writes are keyed by `(campaign_id, recipient_key)` and are idempotent:
//! the first outcome recorded for a key wins and later writes are
//! acknowledged as duplicates, so a crash-and-resume never double-counts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::quota::QuotaWindow;
use super::DeliveryOutcome;

/// Acknowledgement of an outcome write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAck {
    /// The outcome was stored.
    Recorded,
    /// An outcome already existed for the key; nothing changed.
    Duplicate,
}

/// Errors produced by a sink implementation.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The backing store rejected or failed the operation.
    #[error("delivery record storage failed: {0}")]
    Storage(String),

    /// The sink has shut down.
    #[error("delivery record sink is closed")]
    Closed,
}

/// Persistence collaborator for delivery outcomes.
///
/// Implementations must be safe under concurrent calls from many workers.
#[async_trait]
pub trait DeliveryRecordSink: Send + Sync {
    /// Persist the terminal outcome for one recipient.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the write could not be made durable.
    async fn write_outcome(
        &self,
        campaign_id: &str,
        recipient_key: &str,
        outcome: &DeliveryOutcome,
    ) -> Result<WriteAck, SinkError>;

    /// Previously recorded outcome for a key, used to resume a run.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store cannot be read.
    async fn existing_outcome(
        &self,
        campaign_id: &str,
        recipient_key: &str,
    ) -> Result<Option<DeliveryOutcome>, SinkError>;

    /// Stored quota window starting at `window_start`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store cannot be read.
    async fn load_quota_window(
        &self,
        _window_start: DateTime<Utc>,
    ) -> Result<Option<QuotaWindow>, SinkError> {
        Ok(None)
    }

    /// Persist the current quota window.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the write fails.
    async fn save_quota_window(&self, _window: &QuotaWindow) -> Result<(), SinkError> {
        Ok(())
    }

    /// Whether the recipient opted out or was suppressed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store cannot be read.
    async fn is_suppressed(&self, _recipient: &str) -> Result<bool, SinkError> {
        Ok(false)
    }
}

/// Process-local sink, used for dry validation runs and tests.
#[derive(Debug, Default)]
pub struct InMemorySink {
    outcomes: Mutex<HashMap<(String, String), DeliveryOutcome>>,
    quota: Mutex<Option<QuotaWindow>>,
    suppressed: Mutex<HashSet<String>>,
    write_calls: AtomicUsize,
}

impl InMemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a recipient to the suppression list.
    pub fn suppress(&self, recipient: &str) {
        self.suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(recipient.trim().to_lowercase());
    }

    /// Number of distinct outcome records.
    pub fn len(&self) -> usize {
        self.lock_outcomes().len()
    }

    /// Whether no outcome has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total `write_outcome` calls, including duplicates.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::Relaxed)
    }

    /// All recorded outcomes, in no particular order.
    pub fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.lock_outcomes().values().cloned().collect()
    }

    /// Last saved quota window.
    pub fn quota_window(&self) -> Option<QuotaWindow> {
        self.quota
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_outcomes(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), DeliveryOutcome>> {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeliveryRecordSink for InMemorySink {
    async fn write_outcome(
        &self,
        campaign_id: &str,
        recipient_key: &str,
        outcome: &DeliveryOutcome,
    ) -> Result<WriteAck, SinkError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        let mut outcomes = self.lock_outcomes();
        let key = (campaign_id.to_owned(), recipient_key.to_owned());
        if outcomes.contains_key(&key) {
            return Ok(WriteAck::Duplicate);
        }
        outcomes.insert(key, outcome.clone());
        Ok(WriteAck::Recorded)
    }

    async fn existing_outcome(
        &self,
        campaign_id: &str,
        recipient_key: &str,
    ) -> Result<Option<DeliveryOutcome>, SinkError> {
        let key = (campaign_id.to_owned(), recipient_key.to_owned());
        Ok(self.lock_outcomes().get(&key).cloned())
    }

    async fn load_quota_window(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<Option<QuotaWindow>, SinkError> {
        Ok(self
            .quota_window()
            .filter(|window| window.window_start == window_start))
    }

    async fn save_quota_window(&self, window: &QuotaWindow) -> Result<(), SinkError> {
        *self.quota.lock().unwrap_or_else(PoisonError::into_inner) = Some(window.clone());
        Ok(())
    }

    async fn is_suppressed(&self, recipient: &str) -> Result<bool, SinkError> {
        Ok(self
            .suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&recipient.trim().to_lowercase()))
    }
}
