//! Open/click tracking for trackable messages
//!
//! Records are created by the dispatcher when a trackable message is handed
//! off, and advanced afterwards by the engagement endpoint. Every counter
//! update is a single statement, so concurrent writers never lose counts.

use chrono::{DateTime, Utc};
use sendq_common::{QueueStatus, TrackingStatus};
use serde::Serialize;
use tracing::debug;

use crate::{
    db::{Database, from_millis, status_list, to_millis},
    error::StoreError,
};

#[derive(Debug, sqlx::FromRow)]
struct TrackingRow {
    tracking_id: String,
    recipient_email: String,
    subject: String,
    status: String,
    open_count: i64,
    click_count: i64,
    opened_at: Option<i64>,
    clicked_at: Option<i64>,
    created_at: i64,
}

/// Engagement state of one sent message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingRecord {
    pub tracking_id: String,
    pub recipient_email: String,
    pub subject: String,
    pub status: TrackingStatus,
    pub open_count: u64,
    pub click_count: u64,
    /// First open only
    pub opened_at: Option<DateTime<Utc>>,
    /// First click only
    pub clicked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TrackingRow> for TrackingRecord {
    type Error = StoreError;

    fn try_from(row: TrackingRow) -> Result<Self, Self::Error> {
        let count = |value: i64| {
            u64::try_from(value).map_err(|_| {
                StoreError::InvalidData(format!(
                    "negative counter {value} on tracking record {}",
                    row.tracking_id
                ))
            })
        };

        Ok(Self {
            status: row.status.parse()?,
            open_count: count(row.open_count)?,
            click_count: count(row.click_count)?,
            opened_at: row.opened_at.map(from_millis).transpose()?,
            clicked_at: row.clicked_at.map(from_millis).transpose()?,
            created_at: from_millis(row.created_at)?,
            tracking_id: row.tracking_id,
            recipient_email: row.recipient_email,
            subject: row.subject,
        })
    }
}

/// Aggregate engagement over a time range.
///
/// Rates are percentages of `total_sent`, rounded to two decimals, and are
/// `0.0` when nothing was sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingStats {
    pub total_sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
}

#[allow(clippy::cast_precision_loss)]
fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }

    (part as f64 * 10_000.0 / total as f64).round() / 100.0
}

fn tracking_list(statuses: &[TrackingStatus]) -> String {
    statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct TrackingStore {
    db: Database,
}

impl TrackingStore {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the record for a handed-off message.
    ///
    /// Returns `false` if a record with this id already exists, in which case
    /// it is left untouched.
    #[tracing::instrument(skip(self, recipient, subject), err)]
    pub async fn record_sent(
        &self,
        tracking_id: &str,
        recipient: &str,
        subject: &str,
    ) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO email_tracking \
                (tracking_id, recipient_email, subject, status, open_count, click_count, created_at) \
             VALUES (?, ?, ?, 'sent', 0, 0, ?)",
        )
        .bind(tracking_id)
        .bind(recipient)
        .bind(subject)
        .bind(to_millis(Utc::now()))
        .execute(self.db.pool())
        .await?
        .rows_affected()
            == 1;

        Ok(inserted)
    }

    /// Receipt-level delivery confirmation. Only moves `sent` forward.
    #[tracing::instrument(skip(self), err)]
    pub async fn record_delivered(&self, tracking_id: &str) -> Result<bool, StoreError> {
        self.advance(tracking_id, TrackingStatus::Delivered, "").await
    }

    /// Count an open; `opened_at` keeps the first one.
    #[tracing::instrument(skip(self), err)]
    pub async fn record_open(&self, tracking_id: &str) -> Result<bool, StoreError> {
        self.advance(
            tracking_id,
            TrackingStatus::Opened,
            "open_count = open_count + 1, opened_at = COALESCE(opened_at, ?2),",
        )
        .await
    }

    /// Count a click.
    ///
    /// A click implies the message was rendered, so a missing open is
    /// backfilled: `opened_at` is set and `open_count` raised to at least one.
    #[tracing::instrument(skip(self), err)]
    pub async fn record_click(&self, tracking_id: &str) -> Result<bool, StoreError> {
        self.advance(
            tracking_id,
            TrackingStatus::Clicked,
            "click_count = click_count + 1, clicked_at = COALESCE(clicked_at, ?2), \
             opened_at = COALESCE(opened_at, ?2), open_count = MAX(open_count, 1),",
        )
        .await
    }

    /// Apply `counters` and move the record (and its queue item) towards
    /// `target` if they are still behind it.
    ///
    /// Returns whether the record exists.
    async fn advance(
        &self,
        tracking_id: &str,
        target: TrackingStatus,
        counters: &str,
    ) -> Result<bool, StoreError> {
        let now = to_millis(Utc::now());
        let behind = target.predecessors();

        let mut tx = self.db.pool().begin().await?;

        let sql = format!(
            "UPDATE email_tracking SET {counters} \
                 status = CASE WHEN status IN ({}) THEN '{}' ELSE status END \
             WHERE tracking_id = ?1",
            tracking_list(&behind),
            target.as_str(),
        );

        // `?2` is the event time, only referenced by the counter updates
        let mut query = sqlx::query(&sql).bind(tracking_id);
        if !counters.is_empty() {
            query = query.bind(now);
        }

        let found = query.execute(&mut *tx).await?.rows_affected() == 1;

        if found {
            let queue_behind: Vec<QueueStatus> = behind
                .iter()
                .map(|status| status.queue_status())
                .collect();

            let advanced = sqlx::query(&format!(
                "UPDATE email_queue SET status = ?, updated_at = ? \
                 WHERE tracking_id = ? AND status IN ({})",
                status_list(&queue_behind)
            ))
            .bind(target.queue_status().as_str())
            .bind(now)
            .bind(tracking_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            debug!(tracking_id, status = %target, queue_items = advanced, "Recorded engagement");
        }

        tx.commit().await?;

        Ok(found)
    }

    pub async fn get(&self, tracking_id: &str) -> Result<Option<TrackingRecord>, StoreError> {
        sqlx::query_as::<_, TrackingRow>(
            "SELECT tracking_id, recipient_email, subject, status, open_count, click_count, \
                    opened_at, clicked_at, created_at \
             FROM email_tracking WHERE tracking_id = ?",
        )
        .bind(tracking_id)
        .fetch_optional(self.db.pool())
        .await?
        .map(TrackingRecord::try_from)
        .transpose()
    }

    /// Engagement for records created in `[from, to)`.
    #[tracing::instrument(skip(self), level = "debug", err)]
    pub async fn stats_for_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TrackingStats, StoreError> {
        let (total, delivered, opened, clicked): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN status IN ('delivered', 'opened', 'clicked') THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN opened_at IS NOT NULL THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN clicked_at IS NOT NULL THEN 1 ELSE 0 END), 0) \
             FROM email_tracking WHERE created_at >= ? AND created_at < ?",
        )
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_one(self.db.pool())
        .await?;

        let count = |value: i64| u64::try_from(value).unwrap_or_default();
        let (total_sent, delivered, opened, clicked) =
            (count(total), count(delivered), count(opened), count(clicked));

        Ok(TrackingStats {
            total_sent,
            delivered,
            opened,
            clicked,
            delivery_rate: rate(delivered, total_sent),
            open_rate: rate(opened, total_sent),
            click_rate: rate(clicked, total_sent),
        })
    }
}
