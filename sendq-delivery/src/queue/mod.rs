//! Durable email queue

pub mod retry;

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use sendq_common::{QueueStatus, operator};
use tracing::{debug, warn};

use crate::{
    db::{Database, from_millis, status_list, to_millis},
    error::StoreError,
    policy::{RetryPolicy, retry::CANCELLED_REASON},
    types::{NewEmail, Outcome, QueueItem, QueueItemId, Transition, is_valid_recipient},
};

const QUEUE_COLUMNS: &str = "id, recipient_email, subject, body, status, retry_count, \
                             next_retry_at, last_error, tracking_id, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: i64,
    recipient_email: String,
    subject: String,
    body: String,
    status: String,
    retry_count: i64,
    next_retry_at: Option<i64>,
    last_error: Option<String>,
    tracking_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = StoreError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: QueueItemId::new(row.id),
            recipient_email: row.recipient_email,
            subject: row.subject,
            body: row.body,
            status: row.status.parse()?,
            retry_count: u32::try_from(row.retry_count).map_err(|_| {
                StoreError::InvalidData(format!(
                    "retry_count {} on item {}",
                    row.retry_count, row.id
                ))
            })?,
            next_retry_at: row.next_retry_at.map(from_millis).transpose()?,
            last_error: row.last_error,
            tracking_id: row.tracking_id,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

fn rows_to_items(rows: Vec<QueueRow>) -> Result<Vec<QueueItem>, StoreError> {
    rows.into_iter().map(QueueItem::try_from).collect()
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The queue of outbound email work items.
///
/// Every state change is a single conditional `UPDATE`, so callers racing on
/// the same row cannot both win.
#[derive(Debug, Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add a message to the queue as `pending`.
    ///
    /// Trackable messages get their tracking id here, so it is known before
    /// the sender embeds it.
    #[tracing::instrument(skip(self, email), fields(recipient = %email.recipient), err)]
    pub async fn enqueue(&self, email: &NewEmail) -> Result<QueueItemId, StoreError> {
        let recipient = email.recipient.trim();
        if !is_valid_recipient(recipient) {
            return Err(StoreError::InvalidArgument(format!(
                "not an email address: {:?}",
                email.recipient
            )));
        }

        let now = to_millis(Utc::now());
        let tracking_id = email.trackable.then(|| ulid::Ulid::new().to_string());

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO email_queue \
                (recipient_email, subject, body, status, retry_count, tracking_id, created_at, updated_at) \
             VALUES (?, ?, ?, 'pending', 0, ?, ?, ?) \
             RETURNING id",
        )
        .bind(recipient)
        .bind(&email.subject)
        .bind(&email.body)
        .bind(&tracking_id)
        .bind(now)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        debug!(item_id = id, trackable = email.trackable, "Enqueued email");

        Ok(QueueItemId::new(id))
    }

    pub async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM email_queue WHERE id = ?"
        ))
        .bind(id.get())
        .fetch_optional(self.db.pool())
        .await?
        .map(QueueItem::try_from)
        .transpose()
    }

    /// Most recent items first, optionally filtered by status
    pub async fn list(
        &self,
        status: Option<QueueStatus>,
        limit: u32,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, QueueRow>(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM email_queue WHERE status = ? ORDER BY id DESC LIMIT ?"
                ))
                .bind(status.as_str())
                .bind(i64::from(limit))
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, QueueRow>(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM email_queue ORDER BY id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(self.db.pool())
                .await?
            }
        };

        rows_to_items(rows)
    }

    /// Atomically move up to `limit` due `pending` items to `sending` and return them.
    ///
    /// Selection and update are one statement, so two concurrent claims never
    /// return the same item. Items come back ordered by id.
    #[tracing::instrument(skip(self), level = "debug", err)]
    pub async fn claim_due_batch(&self, limit: u32) -> Result<Vec<QueueItem>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = to_millis(Utc::now());

        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            "UPDATE email_queue SET status = 'sending', updated_at = ? \
             WHERE id IN ( \
                 SELECT id FROM email_queue \
                 WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?) \
                 ORDER BY id \
                 LIMIT ? \
             ) \
             RETURNING {QUEUE_COLUMNS}"
        ))
        .bind(now)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;

        let mut items = rows_to_items(rows)?;
        items.sort_by_key(|item| item.id);

        Ok(items)
    }

    /// Record the outcome of a delivery attempt.
    ///
    /// Only applies while the item is still `sending`; a repeated or late call
    /// returns `Ok(None)` and changes nothing.
    #[tracing::instrument(skip(self, policy), err)]
    pub async fn mark_outcome(
        &self,
        id: QueueItemId,
        outcome: &Outcome,
        policy: &RetryPolicy,
    ) -> Result<Option<Transition>, StoreError> {
        let current: Option<(String, i64)> =
            sqlx::query_as("SELECT status, retry_count FROM email_queue WHERE id = ?")
                .bind(id.get())
                .fetch_optional(self.db.pool())
                .await?;

        let Some((status, retry_count)) = current else {
            return Ok(None);
        };

        if status.parse::<QueueStatus>()? != QueueStatus::Sending {
            return Ok(None);
        }

        let retry_count = u32::try_from(retry_count)
            .map_err(|_| StoreError::InvalidData(format!("retry_count {retry_count} on item {id}")))?;

        let now = Utc::now();
        let transition = policy.decide(retry_count, outcome, now);

        // Guarding on the retry count as well keeps a racing writer from
        // applying a decision made against a stale count.
        let applied = self
            .apply(
                id,
                &[QueueStatus::Sending],
                Some(i64::from(retry_count)),
                &transition,
                now,
            )
            .await?;

        Ok(applied.then_some(transition))
    }

    /// Cancel an item that has not been sent. Only `pending` and `failed` items qualify.
    #[tracing::instrument(skip(self), err)]
    pub async fn cancel(&self, id: QueueItemId) -> Result<bool, StoreError> {
        let cancellable: Vec<QueueStatus> = QueueStatus::ALL
            .into_iter()
            .filter(|status| status.is_cancellable())
            .collect();

        let sql = format!(
            "UPDATE email_queue SET status = ?, last_error = ?, next_retry_at = NULL, updated_at = ? \
             WHERE id = ? AND status IN ({})",
            status_list(&cancellable)
        );

        let cancelled = sqlx::query(&sql)
            .bind(QueueStatus::Cancelled.as_str())
            .bind(CANCELLED_REASON)
            .bind(to_millis(Utc::now()))
            .bind(id.get())
            .execute(self.db.pool())
            .await?
            .rows_affected()
            == 1;

        if cancelled {
            operator!("Cancelled queue item {id}");
        }

        Ok(cancelled)
    }

    /// Operator retry: reset a finished item to a fresh `pending` state.
    ///
    /// Without `force` only `failed`, `bounced` and `cancelled` items qualify;
    /// with it any terminal item does. In-flight and pending items never do.
    #[tracing::instrument(skip(self), err)]
    pub async fn retry(&self, id: QueueItemId, force: bool) -> Result<bool, StoreError> {
        let eligible: Vec<QueueStatus> = QueueStatus::ALL
            .into_iter()
            .filter(|status| {
                if force {
                    status.is_terminal()
                } else {
                    status.is_retryable()
                }
            })
            .collect();

        let reset = self
            .apply(id, &eligible, None, &RetryPolicy::manual_retry(), Utc::now())
            .await?;

        if reset {
            operator!("Queue item {id} reset for retry");
        }

        Ok(reset)
    }

    /// Return items stuck in `sending` for longer than `older_than` to `pending`.
    ///
    /// Each reclaimed item has its retry count incremented once; the claim
    /// time is refreshed, so the same item is not reclaimed twice. An item
    /// whose incremented count reaches the policy's budget is marked `failed`
    /// instead of being requeued.
    #[tracing::instrument(skip(self, policy), level = "debug", err)]
    pub async fn reclaim_stale(
        &self,
        older_than: Duration,
        policy: &RetryPolicy,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = to_millis(before(now, older_than));
        let now = to_millis(now);

        let mut tx = self.db.pool().begin().await?;

        // SET expressions see the row as it was before the update
        let exhausted = sqlx::query(
            "UPDATE email_queue \
             SET status = 'failed', retry_count = retry_count + 1, next_retry_at = NULL, \
                 last_error = 'retries exhausted after ' || (retry_count + 1) || ' attempts: stale claim', \
                 updated_at = ? \
             WHERE status = 'sending' AND updated_at <= ? AND retry_count + 1 >= ?",
        )
        .bind(now)
        .bind(cutoff)
        .bind(i64::from(policy.max_retries))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            "UPDATE email_queue \
             SET status = 'pending', retry_count = retry_count + 1, next_retry_at = NULL, \
                 last_error = ?, updated_at = ? \
             WHERE status = 'sending' AND updated_at <= ?",
        )
        .bind(format!(
            "stale claim: in sending for more than {}s",
            older_than.as_secs()
        ))
        .bind(now)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if requeued > 0 {
            warn!(
                reclaimed = requeued,
                older_than_secs = older_than.as_secs(),
                "Reclaimed stale claims left in sending"
            );
        }

        if exhausted > 0 {
            warn!(
                failed = exhausted,
                max_retries = policy.max_retries,
                "Stale claims out of retries, marked failed"
            );
        }

        Ok(exhausted + requeued)
    }

    /// Delete finished items last updated more than `older_than_days` ago.
    ///
    /// An empty `statuses` means every terminal status. Asking to purge a
    /// non-terminal status is refused.
    #[tracing::instrument(skip(self), err)]
    pub async fn purge(
        &self,
        older_than_days: u32,
        statuses: &[QueueStatus],
    ) -> Result<u64, StoreError> {
        if let Some(status) = statuses.iter().find(|status| !status.is_terminal()) {
            return Err(StoreError::InvalidArgument(format!(
                "refusing to purge non-terminal status {status}"
            )));
        }

        let statuses = if statuses.is_empty() {
            &QueueStatus::TERMINAL[..]
        } else {
            statuses
        };

        let cutoff = before(
            Utc::now(),
            Duration::from_secs(u64::from(older_than_days) * 86_400),
        );

        let purged = sqlx::query(&format!(
            "DELETE FROM email_queue WHERE status IN ({}) AND updated_at < ?",
            status_list(statuses)
        ))
        .bind(to_millis(cutoff))
        .execute(self.db.pool())
        .await?
        .rows_affected();

        operator!("Purged {purged} queue items older than {older_than_days} days");

        Ok(purged)
    }

    /// Apply `transition` if the item is currently in one of `from`
    /// (and, when given, still has `retry_count`).
    async fn apply(
        &self,
        id: QueueItemId,
        from: &[QueueStatus],
        retry_count: Option<i64>,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE email_queue \
             SET status = ?, retry_count = ?, next_retry_at = ?, last_error = ?, updated_at = ? \
             WHERE id = ? AND status IN ({}) AND (? IS NULL OR retry_count = ?)",
            status_list(from)
        );

        let affected = sqlx::query(&sql)
            .bind(transition.status.as_str())
            .bind(i64::from(transition.retry_count))
            .bind(transition.next_retry_at.map(to_millis))
            .bind(&transition.last_error)
            .bind(to_millis(now))
            .bind(id.get())
            .bind(retry_count)
            .bind(retry_count)
            .execute(self.db.pool())
            .await?
            .rows_affected();

        Ok(affected == 1)
    }
}
