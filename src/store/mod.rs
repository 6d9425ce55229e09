//! SQLite-backed delivery record store.
//!
//! Implements [`DeliveryRecordSink`] on a local SQLite database: terminal
//! outcomes keyed by `(campaign_id, recipient_key)`, persisted quota windows,
//! and the suppression list. All reads go directly through the connection
//! pool (concurrent); all writes go through a single-writer actor
//! ([`writer`]). The schema is applied inline via `include_str!` on open.

pub mod writer;

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::delivery::quota::QuotaWindow;
use crate::delivery::sink::{DeliveryRecordSink, SinkError, WriteAck};
use crate::delivery::DeliveryOutcome;

use self::writer::WriteOp;

/// Writer channel capacity: bounded to provide backpressure.
const WRITER_CHANNEL_CAPACITY: usize = 1024;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored outcome could not be encoded or decoded.
    #[error("outcome record error: {0}")]
    Record(#[from] serde_json::Error),

    /// A stored integer did not fit its Rust type.
    #[error("invalid {field} value: {value}")]
    OutOfRange {
        /// Column name.
        field: &'static str,
        /// The unexpected value.
        value: i64,
    },

    /// Write channel is closed (writer actor stopped).
    #[error("delivery store writer channel closed")]
    WriterClosed,
}

impl From<StoreError> for SinkError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WriterClosed => SinkError::Closed,
            other => SinkError::Storage(other.to_string()),
        }
    }
}

/// Flattened outcome row as written to `delivery_outcomes`.
#[derive(Debug, Clone)]
pub struct OutcomeRow {
    /// Campaign identifier.
    pub campaign_id: String,
    /// Deduplication key.
    pub recipient_key: String,
    /// Recipient address.
    pub recipient: String,
    /// Outcome status text.
    pub status: &'static str,
    /// Skip reason text.
    pub skip_reason: Option<&'static str>,
    /// Attempts made.
    pub attempts: i64,
    /// Provider message id.
    pub provider_message_id: Option<String>,
    /// Class of the last error.
    pub error_class: Option<&'static str>,
    /// Message of the last error.
    pub error_message: Option<String>,
    /// Latency in milliseconds.
    pub latency_ms: i64,
    /// RFC 3339 completion time.
    pub finished_at: String,
    /// Full outcome as JSON, used to resume.
    pub record: String,
}

impl OutcomeRow {
    /// Flatten an outcome for insertion.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Record`] if the outcome cannot be serialized.
    pub fn new(
        campaign_id: &str,
        recipient_key: &str,
        outcome: &DeliveryOutcome,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            campaign_id: campaign_id.to_owned(),
            recipient_key: recipient_key.to_owned(),
            recipient: outcome.recipient.clone(),
            status: outcome.status.as_str(),
            skip_reason: outcome.skip_reason.map(|reason| reason.as_str()),
            attempts: i64::from(outcome.attempts),
            provider_message_id: outcome.provider_message_id.clone(),
            error_class: outcome.last_error.as_ref().map(|e| e.class.as_str()),
            error_message: outcome.last_error.as_ref().map(|e| e.message.clone()),
            latency_ms: i64::try_from(outcome.latency.as_millis()).unwrap_or(i64::MAX),
            finished_at: timestamp(outcome.finished_at),
            record: serde_json::to_string(outcome)?,
        })
    }
}

/// Canonical text form of a timestamp in the database.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// SQLite delivery record store.
pub struct SqliteDeliveryStore {
    /// Connection pool for reads.
    db: SqlitePool,
    /// Channel to the single-writer actor.
    writer_tx: mpsc::Sender<WriteOp>,
    /// Writer actor join handle (held so we can await on shutdown).
    writer_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for SqliteDeliveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDeliveryStore").finish_non_exhaustive()
    }
}

impl SqliteDeliveryStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open delivery database at {}", path.display()))?;

        let migration_sql = include_str!("../../migrations/001_campaign_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply campaign schema migration")?;

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(writer::run_writer(pool.clone(), writer_rx));
        info!(path = %path.display(), "delivery store opened");

        Ok(Self {
            db: pool,
            writer_tx,
            writer_handle,
        })
    }

    /// Suppress future sends to `email` in every campaign.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn add_suppression(&self, email: &str, reason: Option<&str>) -> Result<(), StoreError> {
        self.submit(|ack| WriteOp::AddSuppression {
            email: normalize(email),
            reason: reason.map(str::to_owned),
            ack,
        })
        .await?
    }

    /// Recorded outcome counts for a campaign, by status text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub async fn status_counts(&self, campaign_id: &str) -> Result<Vec<(String, u64)>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, count(*) FROM delivery_outcomes \
             WHERE campaign_id = ?1 GROUP BY status ORDER BY status",
        )
        .bind(campaign_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter()
            .map(|(status, count)| {
                u64::try_from(count)
                    .map(|count| (status, count))
                    .map_err(|_| StoreError::OutOfRange {
                        field: "count",
                        value: count,
                    })
            })
            .collect()
    }

    /// Returns a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Gracefully shut down the writer actor.
    ///
    /// Drops the sender channel and awaits the writer task to drain.
    pub async fn shutdown(self) {
        drop(self.writer_tx);
        let _ = self.writer_handle.await;
        info!("delivery store shut down");
    }

    async fn submit<T>(
        &self,
        op: impl FnOnce(oneshot::Sender<Result<T, StoreError>>) -> WriteOp,
    ) -> Result<Result<T, StoreError>, StoreError> {
        let (ack, done) = oneshot::channel();
        self.writer_tx
            .send(op(ack))
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        done.await.map_err(|_| StoreError::WriterClosed)
    }
}

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

fn to_u32(field: &'static str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::OutOfRange { field, value })
}

#[async_trait]
impl DeliveryRecordSink for SqliteDeliveryStore {
    async fn write_outcome(
        &self,
        campaign_id: &str,
        recipient_key: &str,
        outcome: &DeliveryOutcome,
    ) -> Result<WriteAck, SinkError> {
        let row = OutcomeRow::new(campaign_id, recipient_key, outcome)?;
        let ack = self
            .submit(|ack| WriteOp::RecordOutcome {
                row: Box::new(row),
                ack,
            })
            .await??;
        Ok(ack)
    }

    async fn existing_outcome(
        &self,
        campaign_id: &str,
        recipient_key: &str,
    ) -> Result<Option<DeliveryOutcome>, SinkError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT record FROM delivery_outcomes WHERE campaign_id = ?1 AND recipient_key = ?2",
        )
        .bind(campaign_id)
        .bind(recipient_key)
        .fetch_optional(&self.db)
        .await
        .map_err(StoreError::from)?;

        match row {
            Some((record,)) => {
                let outcome = serde_json::from_str(&record).map_err(StoreError::from)?;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    async fn load_quota_window(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<Option<QuotaWindow>, SinkError> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT used, ceiling FROM quota_windows WHERE window_start = ?1")
                .bind(timestamp(window_start))
                .fetch_optional(&self.db)
                .await
                .map_err(StoreError::from)?;

        match row {
            Some((used, ceiling)) => Ok(Some(QuotaWindow {
                window_start,
                used: to_u32("used", used)?,
                ceiling: to_u32("ceiling", ceiling)?,
            })),
            None => Ok(None),
        }
    }

    async fn save_quota_window(&self, window: &QuotaWindow) -> Result<(), SinkError> {
        let window = window.clone();
        self.submit(|ack| WriteOp::SaveQuotaWindow { window, ack })
            .await??;
        Ok(())
    }

    async fn is_suppressed(&self, recipient: &str) -> Result<bool, SinkError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM suppressions WHERE email = ?1")
            .bind(normalize(recipient))
            .fetch_optional(&self.db)
            .await
            .map_err(StoreError::from)?;
        Ok(row.is_some())
    }
}
