//! Campaign summary aggregation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::delivery::{DeliveryOutcome, ErrorClass, OutcomeStatus, SkipReason};

/// Representative error reasons kept per failure class.
pub const MAX_REASONS_PER_CLASS: usize = 3;

/// Aggregate result of one campaign run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignSummary {
    /// Campaign identifier.
    pub campaign_id: String,
    /// Messages handed to the run.
    pub total: usize,
    /// Messages delivered (including resumed deliveries).
    pub delivered: usize,
    /// Messages failed permanently or after exhausting retries.
    pub failed: usize,
    /// Messages never sent.
    pub skipped: usize,
    /// Messages whose outcome was already stored by an earlier run.
    pub resumed: usize,
    /// Outcomes the sink failed to persist.
    pub unpersisted: usize,
    /// Attempts made during this run.
    pub attempts: usize,
    /// Skipped messages broken down by reason.
    pub skipped_by_reason: BTreeMap<SkipReason, usize>,
    /// Up to [`MAX_REASONS_PER_CLASS`] distinct failure reasons per class.
    pub error_reasons: BTreeMap<ErrorClass, Vec<String>>,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Wall time of the run.
    pub duration: Duration,
}

impl CampaignSummary {
    /// Skipped count for one reason.
    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped_by_reason.get(&reason).copied().unwrap_or(0)
    }

    /// Whether every message is accounted for by exactly one outcome.
    pub fn is_complete(&self) -> bool {
        self.delivered
            .saturating_add(self.failed)
            .saturating_add(self.skipped)
            == self.total
    }
}

impl fmt::Display for CampaignSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "campaign {}{}: {} delivered, {} failed, {} skipped of {} in {:.1}s",
            self.campaign_id,
            if self.dry_run { " (dry run)" } else { "" },
            self.delivered,
            self.failed,
            self.skipped,
            self.total,
            self.duration.as_secs_f64()
        )?;
        if self.resumed > 0 {
            write!(f, " ({} resumed)", self.resumed)?;
        }
        Ok(())
    }
}

/// Accumulates outcomes into a [`CampaignSummary`].
#[derive(Debug, Clone)]
pub struct SummaryBuilder {
    summary: CampaignSummary,
}

impl SummaryBuilder {
    /// Start a summary for `total` messages.
    pub fn new(campaign_id: &str, total: usize, dry_run: bool) -> Self {
        Self {
            summary: CampaignSummary {
                campaign_id: campaign_id.to_owned(),
                total,
                delivered: 0,
                failed: 0,
                skipped: 0,
                resumed: 0,
                unpersisted: 0,
                attempts: 0,
                skipped_by_reason: BTreeMap::new(),
                error_reasons: BTreeMap::new(),
                dry_run,
                duration: Duration::ZERO,
            },
        }
    }

    /// Count an outcome resolved during this run.
    pub fn record(&mut self, outcome: &DeliveryOutcome) {
        self.summary.attempts = self
            .summary
            .attempts
            .saturating_add(usize::try_from(outcome.attempts).unwrap_or(usize::MAX));
        self.count(outcome);
    }

    /// Count an outcome stored by a previous run.
    pub fn record_resumed(&mut self, outcome: &DeliveryOutcome) {
        self.summary.resumed = self.summary.resumed.saturating_add(1);
        self.count(outcome);
    }

    /// Note an outcome the sink failed to persist.
    pub fn record_unpersisted(&mut self) {
        self.summary.unpersisted = self.summary.unpersisted.saturating_add(1);
    }

    /// Outcomes resumed so far.
    pub fn resumed(&self) -> usize {
        self.summary.resumed
    }

    /// Finish with the measured run time.
    pub fn finish(mut self, duration: Duration) -> CampaignSummary {
        self.summary.duration = duration;
        self.summary
    }

    fn count(&mut self, outcome: &DeliveryOutcome) {
        let summary = &mut self.summary;
        match outcome.status {
            OutcomeStatus::Delivered => summary.delivered = summary.delivered.saturating_add(1),
            OutcomeStatus::Failed => {
                summary.failed = summary.failed.saturating_add(1);
                if let Some(error) = &outcome.last_error {
                    let reasons = summary.error_reasons.entry(error.class).or_default();
                    if reasons.len() < MAX_REASONS_PER_CLASS && !reasons.contains(&error.message) {
                        reasons.push(error.message.clone());
                    }
                }
            }
            OutcomeStatus::Skipped => {
                summary.skipped = summary.skipped.saturating_add(1);
                if let Some(reason) = outcome.skip_reason {
                    let count = summary.skipped_by_reason.entry(reason).or_insert(0);
                    *count = count.saturating_add(1);
                }
            }
        }
    }
}
