//! Single-writer actor for serialized SQLite writes.
//!
//! Every mutation of the delivery database flows through this actor, so
//! concurrent workers never contend for the SQLite write lock. Each request
//! carries a oneshot channel on which the result is acknowledged.

use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

use crate::delivery::quota::QuotaWindow;
use crate::delivery::sink::WriteAck;

use super::{timestamp, OutcomeRow, StoreError};

/// Operations that can be sent to the write actor.
#[derive(Debug)]
pub enum WriteOp {
    /// Insert an outcome unless one already exists for the key.
    RecordOutcome {
        /// Row to insert.
        row: Box<OutcomeRow>,
        /// Acknowledgement channel.
        ack: oneshot::Sender<Result<WriteAck, StoreError>>,
    },

    /// Upsert a quota window, never lowering its used count.
    SaveQuotaWindow {
        /// Window to persist.
        window: QuotaWindow,
        /// Acknowledgement channel.
        ack: oneshot::Sender<Result<(), StoreError>>,
    },

    /// Add (or re-reason) a suppressed address.
    AddSuppression {
        /// Normalized address.
        email: String,
        /// Why it is suppressed.
        reason: Option<String>,
        /// Acknowledgement channel.
        ack: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Run the single-writer actor loop.
///
/// Processes [`WriteOp`] messages until the sender half is dropped.
pub async fn run_writer(db: SqlitePool, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::RecordOutcome { row, ack } => {
                let result = insert_outcome(&db, &row).await;
                if let Err(err) = &result {
                    error!(campaign_id = %row.campaign_id, error = %err, "outcome write failed");
                }
                // The requester may have given up waiting; nothing to do then.
                let _ = ack.send(result);
            }
            WriteOp::SaveQuotaWindow { window, ack } => {
                let result = save_quota_window(&db, &window).await;
                if let Err(err) = &result {
                    error!(error = %err, "quota window write failed");
                }
                let _ = ack.send(result);
            }
            WriteOp::AddSuppression { email, reason, ack } => {
                let result = add_suppression(&db, &email, reason.as_deref()).await;
                if let Err(err) = &result {
                    error!(error = %err, "suppression write failed");
                }
                let _ = ack.send(result);
            }
        }
    }
    trace!("delivery store writer actor stopped");
}

async fn insert_outcome(db: &SqlitePool, row: &OutcomeRow) -> Result<WriteAck, StoreError> {
    let result = sqlx::query(
        "INSERT INTO delivery_outcomes \
         (campaign_id, recipient_key, recipient, status, skip_reason, attempts, \
          provider_message_id, error_class, error_message, latency_ms, finished_at, record) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
         ON CONFLICT(campaign_id, recipient_key) DO NOTHING",
    )
    .bind(&row.campaign_id)
    .bind(&row.recipient_key)
    .bind(&row.recipient)
    .bind(row.status)
    .bind(row.skip_reason)
    .bind(row.attempts)
    .bind(&row.provider_message_id)
    .bind(row.error_class)
    .bind(&row.error_message)
    .bind(row.latency_ms)
    .bind(&row.finished_at)
    .bind(&row.record)
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        trace!(recipient_key = %row.recipient_key, "outcome already recorded");
        return Ok(WriteAck::Duplicate);
    }
    trace!(recipient_key = %row.recipient_key, status = row.status, "outcome recorded");
    Ok(WriteAck::Recorded)
}

async fn save_quota_window(db: &SqlitePool, window: &QuotaWindow) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO quota_windows (window_start, used, ceiling) VALUES (?1, ?2, ?3) \
         ON CONFLICT(window_start) DO UPDATE SET \
           used = MAX(used, excluded.used), \
           ceiling = excluded.ceiling, \
           updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(timestamp(window.window_start))
    .bind(i64::from(window.used))
    .bind(i64::from(window.ceiling))
    .execute(db)
    .await?;
    trace!(used = window.used, "quota window saved");
    Ok(())
}

async fn add_suppression(
    db: &SqlitePool,
    email: &str,
    reason: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO suppressions (email, reason) VALUES (?1, ?2) \
         ON CONFLICT(email) DO UPDATE SET reason = COALESCE(excluded.reason, reason)",
    )
    .bind(email)
    .bind(reason)
    .execute(db)
    .await?;
    trace!(email, "suppression added");
    Ok(())
}
